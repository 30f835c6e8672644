//! `conclave sessions` — list the panels defined in the config.

use conclave_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if config.sessions.is_empty() {
        println!("No sessions configured. Run `conclave init` to create a starter panel.");
        return Ok(());
    }

    for session in &config.sessions {
        println!(
            "{}  ({}, flow-lock {})",
            session.name,
            session.speaking_mode,
            if session.flow_lock.enabled { "on" } else { "off" }
        );
        for p in config.participants_for(session) {
            let model = p.model.as_ref().map(|m| m.model.as_str()).unwrap_or("-");
            println!("  @{:<12} {:<16} {:?}  {}", p.id, p.display_name, p.role, model);
        }
        println!();
    }
    Ok(())
}
