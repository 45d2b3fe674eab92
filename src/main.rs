use std::time::Duration;

use fguard::protector::{ProtectionConfig, Protector};

/// Demo host: `fguard [config.json] [--verbose]`
fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");

    // fguard info+ on stderr; --verbose enables debug; RUST_LOG overrides
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("fguard", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_target(false)
        .init();

    let config = match args.iter().find(|a| !a.starts_with('-')) {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("[!] Could not load {}: {}", path, e);
                std::process::exit(2);
            }
        },
        None => ProtectionConfig::default(),
    };

    let protector = Protector::new(config);

    println!("[*] Initializing runtime protection");
    if protector.initialize_protection() {
        println!("[+] Attach blocking active");
    } else {
        println!("[!] Attach blocking refused by the platform");
    }
    println!("[*] Security level: {}", protector.security_level());

    // 1. One full sweep of every probe
    let verdict = protector.current_verdict();
    println!("\n[1] Environment verdict:");
    println!("    traced:          {}", verdict.traced);
    println!("    hook framework:  {}", verdict.hooked);
    println!("    timing anomaly:  {}", verdict.timing_anomaly);
    println!("    emulator:        {}", verdict.emulator);
    println!("    virtualized:     {}", verdict.virtualized);

    // 2. What a host would ask before a sensitive operation
    println!("\n[2] Sensitive operation gate:");
    for level in 1..=3 {
        protector.set_security_level(level);
        let analyzed = protector.is_being_analyzed();
        println!("    level {}: {}", level, if analyzed { "refuse" } else { "allow" });
    }

    // 3. Let the monitor run for a few ticks at maximum
    std::thread::sleep(Duration::from_millis(500));
    protector.shutdown_protection();

    match serde_json::to_string_pretty(&protector.stats()) {
        Ok(json) => println!("\n[3] Countermeasures after {} ticks:\n{}", protector.ticks(), json),
        Err(e) => eprintln!("[!] {}", e),
    }

    if verdict.is_threat() {
        println!("\n[!] Operational environment under analysis");
    } else {
        println!("\n[+] Operational environment safe.");
    }
}

fn load_config(path: &str) -> fguard::Result<ProtectionConfig> {
    let raw = std::fs::read_to_string(path)?;
    ProtectionConfig::from_json(&raw)
}
