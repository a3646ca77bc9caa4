//! Демонстрационный пир: обнаружение в LAN и сигнальный канал
//!
//! Запускает каталог присутствия, выводит список найденных устройств и
//! проводит рукопожатие вызова без UI и медиа-движка:
//! - `--call <IP>` предлагает вызов устройству, как только оно появится
//! - входящие предложения принимаются автоматически
//! - строки из stdin отправляются собеседнику, полученные строки печатаются
//!
//! ## Поток вызова
//!
//! ```text
//!  ВЫЗЫВАЮЩИЙ (X)                                 ВЫЗЫВАЕМЫЙ (Y)
//!  ──────────────                                 ──────────────
//!  OfferCall ──────── multicast, раз в 1 с ──────►  Offered(X)
//!  Accepted(Y) ◄──────────── AcceptCall ──────────  send_accept_call()
//!  call_accepted()
//!  TCP listen :8888  ◄──────── connect ───────────  Initiator
//!  Connected          ◄═══════ строки ═══════════►  Connected
//! ```
//!
//! Ручной режим `--listen` / `--connect` открывает сигнальный канал напрямую,
//! минуя каталог.

use anyhow::{Context, Result};
use futures_util::stream::{BoxStream, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_call_signaling::{
    config::AppConfig,
    network::{CallEvent, ConnectionEvent, PresenceDirectory, Role, Roster, SignalingTransport},
    protocol::SignalingPayload,
};

/// Сколько раз инициатор повторяет подключение к вызывающему
const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Пауза между попытками подключения
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Параметры командной строки
#[derive(Debug, Default)]
struct PeerArgs {
    /// Путь к файлу конфигурации
    config_path: Option<PathBuf>,
    /// Объявляемый адрес вместо найденного автоматически
    advertise: Option<Ipv4Addr>,
    /// Кому предложить вызов
    call: Option<Ipv4Addr>,
    /// Не принимать входящие вызовы автоматически
    no_auto_accept: bool,
    /// Ручной режим: слушать адрес
    listen: Option<SocketAddr>,
    /// Ручной режим: подключиться к адресу
    connect: Option<SocketAddr>,
}

/// Текущий вызов и его сигнальный канал
struct ActiveCall {
    transport: SignalingTransport,
    events: BoxStream<'static, ConnectionEvent>,
    peer: Ipv4Addr,
    attempts: u32,
    failed: bool,
}

impl ActiveCall {
    fn open(transport: SignalingTransport, peer: Ipv4Addr) -> Self {
        let events = transport.events().boxed();
        Self {
            transport,
            events,
            peer,
            attempts: 1,
            failed: false,
        }
    }

    /// Инициатор повторяет подключение, пока вызывающий не начал слушать
    fn should_retry(&self) -> bool {
        self.failed
            && self.transport.role() == Role::Initiator
            && self.attempts < MAX_CONNECT_ATTEMPTS
    }

    fn retry(&mut self) {
        self.attempts += 1;
        self.failed = false;
        self.events = self.transport.events().boxed();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Инициализация логирования
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("═══════════════════════════════════════════════════════════════");
    tracing::info!("            LAN Call Signaling - Peer Application              ");
    tracing::info!("═══════════════════════════════════════════════════════════════");

    let args = parse_args();
    let config = load_config(&args)?;

    if let Some(address) = args.listen {
        return run_manual(SignalingTransport::new(address, Role::Acceptor)).await;
    }
    if let Some(address) = args.connect {
        return run_manual(SignalingTransport::new(address, Role::Initiator)).await;
    }

    run_directory(config, &args).await
}

/// Разбор аргументов командной строки
fn parse_args() -> PeerArgs {
    let mut args = PeerArgs::default();

    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < argv.len() {
        let value = argv.get(i + 1);
        match argv[i].as_str() {
            "--config" | "-c" => {
                if let Some(value) = value {
                    args.config_path = Some(PathBuf::from(value));
                    i += 1;
                }
            }
            "--advertise" | "-a" => {
                if let Some(value) = value {
                    args.advertise = parse_or_warn(value, "--advertise");
                    i += 1;
                }
            }
            "--call" => {
                if let Some(value) = value {
                    args.call = parse_or_warn(value, "--call");
                    i += 1;
                }
            }
            "--listen" => {
                if let Some(value) = value {
                    args.listen = parse_or_warn(value, "--listen");
                    i += 1;
                }
            }
            "--connect" => {
                if let Some(value) = value {
                    args.connect = parse_or_warn(value, "--connect");
                    i += 1;
                }
            }
            "--no-auto-accept" => {
                args.no_auto_accept = true;
            }
            "--help" | "-h" => {
                println!("LAN Call Signaling - Peer Application");
                println!();
                println!("Использование: peer [ОПЦИИ]");
                println!();
                println!("Опции:");
                println!("  -c, --config <ФАЙЛ>      Файл конфигурации (TOML)");
                println!("  -a, --advertise <IP>     Объявлять этот адрес вместо найденного");
                println!("  --call <IP>              Предложить вызов устройству");
                println!("  --no-auto-accept         Не принимать входящие вызовы");
                println!("  --listen <АДРЕС:ПОРТ>    Ручной режим: ждать подключения");
                println!("  --connect <АДРЕС:ПОРТ>   Ручной режим: подключиться");
                println!("  -h, --help               Показать справку");
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Неизвестный аргумент: {}", other);
            }
        }
        i += 1;
    }

    args
}

fn parse_or_warn<T: std::str::FromStr>(value: &str, flag: &str) -> Option<T> {
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Некорректное значение для {}: {}", flag, value);
            None
        }
    }
}

/// Загрузить конфигурацию: явный путь, файл по умолчанию или значения по умолчанию
fn load_config(args: &PeerArgs) -> Result<AppConfig> {
    let mut config = match &args.config_path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Не удалось загрузить конфигурацию {}", path.display()))?,
        None => match AppConfig::default_path().filter(|path| path.exists()) {
            Some(path) => {
                tracing::info!("Конфигурация: {}", path.display());
                AppConfig::load(&path)?
            }
            None => AppConfig::default(),
        },
    };

    if args.advertise.is_some() {
        config.presence.advertise_address = args.advertise;
    }

    Ok(config)
}

/// Строки, введённые пользователем
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    rx
}

/// Основной режим: каталог присутствия и автоматическое рукопожатие
async fn run_directory(config: AppConfig, args: &PeerArgs) -> Result<()> {
    let (directory, mut calls) = PresenceDirectory::start(&config.presence)
        .context("Не удалось запустить каталог присутствия")?;
    let mut roster = directory.subscribe_roster();
    let mut input = spawn_stdin_reader();
    let mut stdin_open = true;

    tracing::info!("Локальный адрес: {}", directory.local_address());
    tracing::info!(
        "Группа: {}:{}",
        config.presence.group_address,
        config.presence.group_port
    );

    let mut pending_call = args.call;
    let mut call: Option<ActiveCall> = None;
    let mut shown: Vec<(Ipv4Addr, bool)> = Vec::new();

    tracing::info!("Ожидание устройств - нажмите Ctrl+C для остановки");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Получен сигнал завершения");
                break;
            }

            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = roster.borrow_and_update().clone();
                let summary: Vec<_> = snapshot.peers().iter().map(|p| (p.address, p.busy)).collect();
                if summary != shown {
                    print_roster(&snapshot);
                    shown = summary;
                }

                if let Some(target) = pending_call {
                    if let Some(peer) = snapshot.get(target) {
                        if peer.busy {
                            tracing::warn!("{} занят, ждём", target);
                        } else {
                            directory.send_offer_call(peer)?;
                            tracing::info!("Предлагаем вызов {}", target);
                            pending_call = None;
                        }
                    }
                }
            }

            event = calls.recv() => {
                let Some(event) = event else {
                    tracing::warn!("Каталог присутствия остановлен");
                    break;
                };
                if call.is_some() {
                    tracing::info!("Уже в вызове, пропускаем {:?}", event);
                    continue;
                }

                match event {
                    CallEvent::Offered(peer) => {
                        tracing::info!("Входящий вызов от {}", peer.address);
                        if args.no_auto_accept {
                            continue;
                        }
                        directory.send_accept_call()?;
                        directory.set_busy(true)?;
                        let transport = SignalingTransport::initiator(
                            IpAddr::V4(peer.address),
                            &config.signaling,
                        );
                        call = Some(ActiveCall::open(transport, peer.address));
                    }
                    CallEvent::Accepted(peer) => {
                        tracing::info!("{} принял вызов", peer.address);
                        directory.call_accepted()?;
                        directory.set_busy(true)?;
                        let transport = SignalingTransport::acceptor(&config.signaling)?;
                        call = Some(ActiveCall::open(transport, peer.address));
                    }
                }
            }

            event = next_event(&mut call) => {
                match event {
                    Some(event) => {
                        if let (Some(active), ConnectionEvent::Error(_)) = (call.as_mut(), &event) {
                            active.failed = true;
                        }
                        print_event(&event);
                    }
                    None => {
                        let Some(mut active) = call.take() else { continue };
                        if active.should_retry() {
                            tracing::info!(
                                "Повторное подключение к {} ({}/{})",
                                active.peer,
                                active.attempts + 1,
                                MAX_CONNECT_ATTEMPTS
                            );
                            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                            active.retry();
                            call = Some(active);
                        } else {
                            tracing::info!("Вызов с {} завершён", active.peer);
                            directory.set_busy(false)?;
                        }
                    }
                }
            }

            line = input.recv(), if stdin_open => {
                match (line, &call) {
                    (Some(line), Some(active)) => active.transport.send(&line),
                    (Some(_), None) => tracing::warn!("Нет активного вызова, строка не отправлена"),
                    // stdin закрыт, продолжаем без ввода
                    (None, _) => stdin_open = false,
                }
            }
        }
    }

    tracing::info!("Завершение работы...");
    if let Some(active) = call.take() {
        active.transport.close();
    }
    directory.close();

    Ok(())
}

/// Ручной режим: только сигнальный канал
async fn run_manual(transport: SignalingTransport) -> Result<()> {
    tracing::info!("Сигнальный канал: {:?} {}", transport.role(), transport.address());

    let mut events = transport.events().boxed();
    let mut input = spawn_stdin_reader();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Получен сигнал завершения");
                break;
            }

            event = events.next() => match event {
                Some(event) => print_event(&event),
                None => break,
            },

            line = input.recv(), if stdin_open => match line {
                Some(line) => transport.send(&line),
                None => stdin_open = false,
            },
        }
    }

    transport.close();
    Ok(())
}

async fn next_event(call: &mut Option<ActiveCall>) -> Option<ConnectionEvent> {
    match call {
        Some(active) => active.events.next().await,
        None => std::future::pending().await,
    }
}

fn print_roster(roster: &Roster) {
    println!();
    println!("╔══════════════════════════════════════════╗");
    println!("║            УСТРОЙСТВА В СЕТИ             ║");
    println!("╠══════════════════════════════════════════╣");
    if roster.is_empty() {
        println!("║  (никого)                                ║");
    }
    for peer in roster.peers() {
        let state = if peer.busy { "занят" } else { "свободен" };
        println!("║  {:<18} {:<21} ║", peer.address, state);
    }
    println!("╚══════════════════════════════════════════╝");
}

fn print_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Idle => tracing::debug!("Сигнальный канал: idle"),
        ConnectionEvent::Connecting => tracing::info!("Подключение..."),
        ConnectionEvent::Connected => tracing::info!("Соединение установлено"),
        ConnectionEvent::Error(e) => tracing::warn!("Ошибка соединения: {}", e),
        ConnectionEvent::Data(line) => match SignalingPayload::from_line(line) {
            Ok(SignalingPayload::Offer { sdp }) => println!("<< offer ({} байт SDP)", sdp.len()),
            Ok(SignalingPayload::Answer { sdp }) => println!("<< answer ({} байт SDP)", sdp.len()),
            Ok(SignalingPayload::Candidate { candidate, .. }) => println!("<< candidate {}", candidate),
            Err(_) => println!("<< {}", line),
        },
    }
}
