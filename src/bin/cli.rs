//! FTS CLI - консольная версия движка передачи файлов

use clap::{Parser, Subcommand, ValueEnum};
use fts_engine::config::Settings;
use fts_engine::network::stress::{self, PingOptions};
use fts_engine::network::transport::{self, TransportConfig};
use fts_engine::network::{
    FileRequest, FileTransferService, FileUpload, FtsEvent, TransferStatus, TransportEvent, TransportType,
};
use fts_engine::stats::{format_duration, TransferStats};
use fts_engine::timesync::{TimeRepeater, TimeSync, NTP_PORT};
use fts_engine::utils::{format_size, local_address, with_default_port};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Как часто обновлять прогресс
const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// Тип транспорта для CLI
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    /// TCP - надёжный, стандартный
    Tcp,
    /// UDP - без гарантий доставки, повторы по таймауту
    Udp,
    /// WebSocket - поверх HTTP
    #[cfg(feature = "websocket")]
    Ws,
}

impl From<Transport> for TransportType {
    fn from(t: Transport) -> Self {
        match t {
            Transport::Tcp => TransportType::Tcp,
            Transport::Udp => TransportType::Udp,
            #[cfg(feature = "websocket")]
            Transport::Ws => TransportType::WebSocket,
        }
    }
}

#[derive(Parser)]
#[command(name = "fts_cli")]
#[command(author = "toolza")]
#[command(version)]
#[command(about = "Опрос устройств и передача файлов по локальной сети", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Транспортный протокол (по умолчанию из настроек)
    #[arg(long, value_enum, global = true)]
    transport: Option<Transport>,

    /// Порт передачи файлов (0 - любой свободный)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Порт опроса устройств
    #[arg(long, global = true)]
    discovery_port: Option<u16>,

    /// Файл настроек (по умолчанию в папке конфигурации пользователя)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Подробный лог
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Раздавать файлы и принимать входящие
    Serve {
        /// Папка раздачи
        #[arg(short, long)]
        shared: Option<PathBuf>,

        /// Папка для принятых файлов
        #[arg(short, long)]
        downloads: Option<PathBuf>,

        /// Принимать файлы без подтверждения
        #[arg(short, long)]
        auto: bool,

        /// Имя устройства в ответах на опрос
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Скачать файл из папки раздачи устройства
    Get {
        /// Адрес устройства (IP или IP:порт) или номер из `poll`
        target: String,

        /// Имя файла
        file: String,

        /// Сохранить под другим именем
        #[arg(long)]
        save_as: Option<String>,

        /// Папка для сохранения
        #[arg(short, long)]
        downloads: Option<PathBuf>,
    },

    /// Отправить файл устройству
    Send {
        /// Адрес устройства (IP или IP:порт)
        target: String,

        /// Файл для отправки
        file: PathBuf,
    },

    /// Разослать файл всем найденным устройствам
    Broadcast {
        /// Файл для отправки
        file: PathBuf,

        /// Сколько ждать ответов на опрос (мс)
        #[arg(short, long, default_value_t = 1500)]
        window: u64,
    },

    /// Найти устройства в сети
    Poll {
        /// Опросить конкретный адрес вместо широковещательного запроса
        target: Option<String>,

        /// Сколько ждать ответов (мс)
        #[arg(short, long, default_value_t = 1500)]
        window: u64,
    },

    /// Проверить задержку до устройства кадрами PING
    Ping {
        /// Адрес устройства (IP или IP:порт)
        target: String,

        /// Количество кадров
        #[arg(short, long, default_value_t = 10)]
        count: u64,

        /// Размер кадра (байт)
        #[arg(short, long, default_value_t = 64)]
        size: usize,
    },

    /// Синхронизировать время (NTP по UDP или ретранслятор по TCP/WebSocket)
    Time {
        /// Сервер времени
        server: String,

        /// Порт сервера (по умолчанию 123)
        #[arg(long, default_value_t = NTP_PORT)]
        server_port: u16,

        /// Количество замеров
        #[arg(short, long, default_value_t = 4)]
        rounds: usize,
    },

    /// Раздавать своё время другим устройствам
    Repeater {
        /// Порт ретранслятора
        #[arg(long, default_value_t = NTP_PORT)]
        listen: u16,

        /// Сначала синхронизироваться с этим NTP сервером
        #[arg(long)]
        sync_from: Option<String>,

        /// Считать свои часы эталоном (stratum 1) даже без синхронизации
        #[arg(long)]
        reference: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings = load_settings(&cli);

    match cli.command {
        Commands::Serve { shared, downloads, auto, name } => {
            let mut settings = settings;
            if let Some(dir) = shared {
                settings.shared_folder = dir;
                settings.shared_folder_is_absolute = true;
            }
            if let Some(dir) = downloads {
                settings.download_folder = dir;
                settings.download_folder_is_absolute = true;
            }
            if let Some(name) = name {
                settings.device_name = name;
            }
            settings.auto_download |= auto;
            serve(settings).await;
        }
        Commands::Get { target, file, save_as, downloads } => {
            let mut settings = settings;
            if let Some(dir) = downloads {
                settings.download_folder = dir;
                settings.download_folder_is_absolute = true;
            }
            get_file(settings, target, file, save_as).await;
        }
        Commands::Send { target, file } => send_file(settings, target, file).await,
        Commands::Broadcast { file, window } => broadcast_file(settings, file, Duration::from_millis(window)).await,
        Commands::Poll { target, window } => poll(settings, target, Duration::from_millis(window)).await,
        Commands::Ping { target, count, size } => ping(settings, target, count, size).await,
        Commands::Time { server, server_port, rounds } => sync_time(settings, server, server_port, rounds).await,
        Commands::Repeater { listen, sync_from, reference } => run_repeater(settings, listen, sync_from, reference).await,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "fts_engine=debug,fts_cli=debug" } else { "fts_engine=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_settings(cli: &Cli) -> Settings {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    if let Some(transport) = cli.transport {
        settings.transport_type = transport.into();
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(port) = cli.discovery_port {
        settings.discovery_port = port;
    }
    settings.normalized()
}

async fn start_engine(settings: Settings) -> (FileTransferService, mpsc::UnboundedReceiver<FtsEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    match FileTransferService::start(settings, tx).await {
        Ok(service) => (service, rx),
        Err(e) => {
            eprintln!("❌ Не удалось запустить движок: {}", e);
            std::process::exit(1);
        }
    }
}

fn progress_bar(total: u64, name: &str) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(name.to_string());
    bar
}

async fn serve(settings: Settings) {
    let auto = settings.auto_download;
    let (service, mut rx) = start_engine(settings).await;
    let settings = service.settings();

    println!();
    println!("📥 Движок запущен");
    println!("   Имя: {}", settings.device_name);
    println!("   IP: {}", local_address(settings.ip_mode));
    println!("   Порт: {} ({})", service.port(), settings.transport_type);
    println!("   Опрос: порт {}", service.discovery_port());
    println!("   Раздача: {}", settings.shared_dir().display());
    println!("   Загрузки: {}", settings.download_dir().display());
    if auto {
        println!("   Принимать файлы без подтверждения: да");
    }
    println!();
    println!("Ожидание запросов... (Ctrl+C для выхода)");
    println!();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(FtsEvent::ConfirmationRequested(request)) => confirm(&service, request).await,
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    service.shutdown().await;
}

/// Спросить пользователя, принимать ли файл
async fn confirm(service: &FileTransferService, request: FileRequest) {
    println!(
        "❓ {} хочет отправить {} ({}). Принять? [y/N]",
        request.sender().unwrap_or(request.device()),
        request.file_name(),
        format_size(request.total_size())
    );
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await;

    let accepted = matches!(answer, Ok(Ok(line)) if line.trim().eq_ignore_ascii_case("y"));
    if accepted {
        service.gate().confirm(request.id());
        println!("📥 Принимаем {}", request.file_name());
    } else {
        service.gate().reject(request.id());
        println!("🚫 Отклонено: {}", request.file_name());
    }
}

fn print_event(event: &FtsEvent) {
    match event {
        FtsEvent::Connected(addr) => println!("🔗 Подключение: {}", addr),
        FtsEvent::Disconnected(addr) => println!("🔌 Отключение: {}", addr),
        FtsEvent::TransportError(peer, error) => {
            eprintln!("❌ Ошибка транспорта {}: {}", peer.as_deref().unwrap_or("-"), error)
        }
        FtsEvent::DevicesUpdated(devices) => println!("📡 Устройств в сети: {}", devices.len()),
        FtsEvent::DownloadFinished(r) => println!(
            "✅ Получен: {} ({}, {:.1} MB/s)",
            r.save_name(),
            format_size(r.total_size()),
            r.transfer_rate()
        ),
        FtsEvent::DownloadNotFound(r) => eprintln!("❌ {} не найден на {}", r.file_name(), r.device()),
        FtsEvent::DownloadTimeout(r) => eprintln!("⏱ {}: нет ответа от {}", r.file_name(), r.device()),
        FtsEvent::DownloadCancelled(r) => println!("🚫 {}: отменено отправителем", r.file_name()),
        FtsEvent::DownloadFailed(r, error) => eprintln!("❌ {}: {}", r.file_name(), error),
        FtsEvent::ConfirmationRequested(r) => println!("❓ Ожидает подтверждения: {}", r.file_name()),
        FtsEvent::UploadFinished(u) => println!("✅ Отправлен: {} -> {}", u.file_name(), u.target()),
        FtsEvent::UploadTimeout(u) => eprintln!("⏱ {}: {} не отвечает", u.file_name(), u.target()),
        FtsEvent::UploadRejected(u) => println!("🚫 {} отказался от {}", u.target(), u.file_name()),
        FtsEvent::UploadCancelled(u) => println!("🚫 {} отменил приём {}", u.target(), u.file_name()),
        FtsEvent::FileServed(name, peer) => println!("📤 Отдан: {} -> {}", name, peer),
    }
}

/// Номер устройства из `poll` или адрес
fn parse_target(target: &str) -> fts_engine::DeviceTarget {
    match target.parse::<usize>() {
        Ok(index) => index.into(),
        Err(_) => target.into(),
    }
}

async fn get_file(settings: Settings, target: String, file: String, save_as: Option<String>) {
    let (service, mut rx) = start_engine(settings).await;
    if target.parse::<usize>().is_ok() {
        service.poll_devices(None, Duration::from_millis(1500)).await;
    }

    let save_name = save_as.unwrap_or_else(|| file.clone());
    let request = match service.request_file_as(parse_target(&target), &file, &save_name).await {
        Ok(request) => request,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let bar = progress_bar(0, &file);
    let mut stats = TransferStats::default();
    let status = loop {
        tokio::select! {
            status = request.wait() => break status,
            _ = tokio::time::sleep(PROGRESS_TICK) => {
                stats.total_bytes = request.total_size();
                stats.update(request.received_bytes());
                bar.set_length(stats.total_bytes);
                bar.set_position(stats.transferred_bytes);
                bar.set_message(format!("{} ETA {}", file, stats.eta_formatted()));
            }
        }
    };
    bar.set_length(request.total_size());
    bar.set_position(request.received_bytes());

    let reason = std::iter::from_fn(|| rx.try_recv().ok()).find_map(|event| match event {
        FtsEvent::DownloadFailed(r, reason) if r.is_same(&request) => Some(reason),
        _ => None,
    });
    match status {
        TransferStatus::Completed => bar.finish_with_message(format!(
            "✅ {} ({} чанков за {}, {:.1} MB/s)",
            request.save_name(),
            request.chunks_received(),
            format_duration(request.elapsed()),
            request.transfer_rate()
        )),
        TransferStatus::NotFound => bar.abandon_with_message(format!("❌ {} не найден", file)),
        TransferStatus::Timeout => bar.abandon_with_message(format!("⏱ Нет ответа (повторов: {})", request.retries())),
        other => bar.abandon_with_message(format!("🚫 {}: {}", other, reason.unwrap_or_default())),
    }
    service.shutdown().await;
    if status != TransferStatus::Completed {
        std::process::exit(1);
    }
}

async fn wait_upload(upload: &FileUpload, total: u64) -> TransferStatus {
    let bar = progress_bar(total, upload.file_name());
    let mut stats = TransferStats::new(total);
    let status = loop {
        tokio::select! {
            status = upload.wait() => break status,
            _ = tokio::time::sleep(PROGRESS_TICK) => {
                stats.update(upload.sent_bytes());
                bar.set_position(stats.transferred_bytes);
                bar.set_message(format!("{} ETA {}", upload.file_name(), stats.eta_formatted()));
            }
        }
    };
    bar.set_position(upload.sent_bytes());
    match status {
        TransferStatus::Completed => bar.finish_with_message(format!("✅ {} -> {}", upload.file_name(), upload.target())),
        other => bar.abandon_with_message(format!("🚫 {}: {}", upload.file_name(), other)),
    }
    status
}

fn file_arg(file: &std::path::Path) -> (String, u64) {
    match std::fs::metadata(file) {
        Ok(meta) if meta.is_file() => (file.display().to_string(), meta.len()),
        _ => {
            eprintln!("Путь не существует или не является файлом: {}", file.display());
            std::process::exit(1);
        }
    }
}

async fn send_file(settings: Settings, target: String, file: PathBuf) {
    let (path, size) = file_arg(&file);
    let (service, _rx) = start_engine(settings).await;
    if target.parse::<usize>().is_ok() {
        service.poll_devices(None, Duration::from_millis(1500)).await;
    }

    println!("🚀 Отправка {} ({}) на {}", path, format_size(size), target);
    let upload = match service.send_file(parse_target(&target), &path, true).await {
        Ok(upload) => upload,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };
    let status = wait_upload(&upload, size).await;
    service.shutdown().await;
    if status != TransferStatus::Completed {
        std::process::exit(1);
    }
}

async fn broadcast_file(settings: Settings, file: PathBuf, window: Duration) {
    let (path, size) = file_arg(&file);
    let (service, _rx) = start_engine(settings).await;

    println!("🔍 Опрос устройств...");
    let devices = service.poll_devices(None, window).await;
    println!("🚀 Рассылка {} ({}) на {} устройств", path, format_size(size), devices.len());

    let upload = match service.broadcast_file(&path, true).await {
        Ok(upload) => upload,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };
    upload.wait().await;

    println!();
    for target in upload.sent_to() {
        println!("  ✅ {}", target);
    }
    for target in upload.not_sent_to() {
        println!("  ❌ {}", target);
    }
    service.shutdown().await;
}

async fn poll(settings: Settings, target: Option<String>, window: Duration) {
    let (service, _rx) = start_engine(settings).await;

    println!();
    println!("🔍 Опрос устройств (порт {})...", service.discovery_port());
    let devices = service.poll_devices(target.as_deref(), window).await;

    println!();
    if devices.is_empty() {
        println!("Устройства не найдены");
    } else {
        println!("Найдено устройств: {}", devices.len());
        for (index, device) in devices.iter().enumerate() {
            println!(
                "  [{}] {} - {} ({}, {}, v{})",
                index,
                device.name,
                device.endpoint(),
                device.os,
                if device.is_server { "раздаёт" } else { "не раздаёт" },
                device.version
            );
        }
    }
    service.shutdown().await;
}

async fn ping(settings: Settings, target: String, count: u64, size: usize) {
    let addr = with_default_port(&target, settings.port);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = transport::client(settings.transport_type, tx);
    link.setup(TransportConfig::remote(addr.as_str()).with_ip_mode(settings.ip_mode));
    link.connect().await;

    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(TransportEvent::Opened { .. })) => {}
        Ok(Some(TransportEvent::Error { error, .. })) => {
            eprintln!("❌ {}", error);
            std::process::exit(1);
        }
        _ => {
            eprintln!("❌ Не удалось подключиться к {}", addr);
            std::process::exit(1);
        }
    }

    println!("🏓 PING {} ({}) кадрами по {} байт", addr, settings.transport_type, size);
    let options = PingOptions {
        count,
        size,
        ..Default::default()
    };
    let report = stress::run_ping(&link, &mut rx, None, &options, &TimeSync::global()).await;
    println!("{}", report.formatted());
    link.disconnect().await;
}

async fn sync_time(settings: Settings, server: String, port: u16, rounds: usize) {
    let clock = TimeSync::global();
    println!("🕐 Синхронизация с {} ({})", with_default_port(&server, port), settings.transport_type);
    match clock
        .sync_rounds(&server, port, settings.transport_type, settings.timeout(), rounds)
        .await
    {
        Ok(offset) => println!("✅ Смещение часов: {:+.1} мс", offset),
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_repeater(settings: Settings, port: u16, sync_from: Option<String>, reference: bool) {
    let clock = TimeSync::global();
    if let Some(server) = sync_from {
        if let Err(e) = clock.sync_rounds(&server, NTP_PORT, TransportType::Udp, settings.timeout(), 4).await {
            eprintln!("⚠️  Синхронизация не удалась: {}", e);
        }
    }

    if !reference && !clock.is_synced() {
        eprintln!("⚠️  Часы не синхронизированы: SNTP клиенты получат stratum 16 (см. --reference)");
    }
    let repeater = TimeRepeater::new(clock).as_reference(reference);
    match repeater.start(settings.transport_type, port).await {
        Ok(port) => println!("🕐 Ретранслятор времени: {} порт {} (Ctrl+C для выхода)", settings.transport_type, port),
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    }
    let _ = tokio::signal::ctrl_c().await;
    repeater.stop_all().await;
}
