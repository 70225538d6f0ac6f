use clap::{Arg, Command};
use log::LevelFilter;
use sspamm::filter::{FilterEngine, Verdict};
use sspamm::replay;
use sspamm::rules::Category;
use sspamm::session::SessionFactory;
use sspamm::sink::JsonDirSink;
use sspamm::{Config, Milter};
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("sspamm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Regex rule based spam milter with per-domain rule categories")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/sspamm.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Compile all rules and report invalid patterns")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test")
                .long("test")
                .value_name("FILE")
                .help("Replay a saved record (JSON or legacy .var) against the rules")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/sspamm.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    // Initialize logger: --verbose wins, then the configured level
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config
            .log_level
            .as_deref()
            .and_then(|level| level.parse().ok())
            .unwrap_or(LevelFilter::Info)
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let engine = FilterEngine::from_config(&config);

    if matches.get_flag("test-config") {
        test_config(&engine);
        return;
    }

    if let Some(record_file) = matches.get_one::<String>("test") {
        test_record_file(&engine, record_file);
        return;
    }

    if matches.get_flag("daemon") {
        daemonize(&config.pid_file);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {e}");
            process::exit(1);
        }
    };

    let sink = Arc::new(JsonDirSink::new(&config.savedir));
    let factory = Arc::new(SessionFactory::new(Arc::new(engine), sink));
    let milter = Milter::new(factory);

    log::info!("Starting sspamm, saving accepted mail to {}", config.savedir);
    let result = runtime.block_on(milter.run(&config.socket_path));

    if matches.get_flag("daemon") {
        remove_pid_file(&config.pid_file);
    }

    if let Err(e) = result {
        log::error!("Milter error: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        Config::from_file(path)
    } else {
        eprintln!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn test_config(engine: &FilterEngine) {
    println!("🔍 Testing configuration...");
    println!();

    for category in Category::ALL {
        println!(
            "  [{category}] {} rules",
            engine.rules().rules(category).len()
        );
    }
    println!();
    for (domain, categories) in engine.policy().domains() {
        let names: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
        println!("  domain {domain}: {}", names.join(", "));
    }
    println!();

    let skipped = engine.rules().skipped();
    if skipped.is_empty() {
        println!("✅ All regex patterns compiled successfully.");
    } else {
        println!("❌ {} invalid patterns were skipped:", skipped.len());
        for rule in skipped {
            println!("  [{}] {}: {}", rule.category, rule.pattern, rule.error);
        }
        process::exit(1);
    }
}

fn test_record_file(engine: &FilterEngine, record_file: &str) {
    println!("🧪 Testing record: {record_file}");
    println!();

    let mut record = match replay::load_record(Path::new(record_file)) {
        Ok(record) => record,
        Err(e) => {
            eprintln!("❌ Error loading record: {e:#}");
            process::exit(1);
        }
    };

    println!("📧 Record Details:");
    println!("   Id: {}", record.id);
    println!("   Sender: {}", record.sender_address());
    println!("   Recipients: {:?}", record.recipients);
    println!("   Domain: {}", record.recipient_domain());
    if let Some(subject) = &record.subject {
        println!("   Subject: {subject}");
    }
    println!();

    let verdict = replay::replay(engine, &mut record);
    match &verdict {
        Verdict::Accept { .. } => println!("✅ Result: ACCEPT"),
        Verdict::Reject { reply, .. } => {
            println!("❌ Result: REJECT");
            println!("   Reply: {reply}");
        }
    }
    println!("   Actions: {:?}", verdict.actions());
    for (category, hit) in &record.result {
        println!("   [{category}] {} <- {}", hit.action(), hit.matched());
    }
}

/// Detach from the terminal and write the PID file.
fn daemonize(pid_file: &str) {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    log::info!("Starting sspamm in daemon mode...");

    // First fork
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to fork process");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        log::error!("Failed to create new session");
        process::exit(1);
    }

    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork so the daemon can never reacquire a controlling terminal
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to second fork");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if let Err(e) = std::env::set_current_dir("/") {
        log::warn!("Failed to change working directory to /: {e}");
    }

    unsafe {
        libc::umask(0o022);
    }

    if let Ok(dev_null) = OpenOptions::new().read(true).write(true).open("/dev/null") {
        let null_fd = dev_null.as_raw_fd();
        unsafe {
            libc::dup2(null_fd, 0);
            libc::dup2(null_fd, 1);
            libc::dup2(null_fd, 2);
        }
    } else {
        log::warn!("Failed to open /dev/null, standard descriptors left open");
    }

    let pid = unsafe { libc::getpid() };
    if let Err(e) = std::fs::write(pid_file, pid.to_string()) {
        log::warn!("Failed to write PID file: {e}");
    } else {
        log::info!("PID file written: {pid_file} ({pid})");
    }
}

fn remove_pid_file(pid_file: &str) {
    if Path::new(pid_file).exists() {
        match std::fs::remove_file(pid_file) {
            Ok(()) => log::info!("PID file removed"),
            Err(e) => log::warn!("Failed to remove PID file: {e}"),
        }
    }
}
