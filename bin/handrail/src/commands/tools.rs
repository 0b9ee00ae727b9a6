use std::time::Duration;

use handrail_core::{Config, LogicalTool, Paths};
use handrail_protocol::{AutomationClient, ProtocolSession, ToolCatalog};

/// Connect to the automation server and print its advertised tools next to
/// the logical mapping the planner will use.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    println!("Connecting to {} ...", config.automation.server_url);
    let (client, _events) = AutomationClient::connect(
        &config.automation.server_url,
        Duration::from_secs(config.automation.handshake_timeout_secs),
    )
    .await?;

    let descriptors = client.list_tools().await?;
    let catalog = ToolCatalog::resolve(&descriptors);

    println!();
    println!("🔧 Advertised tools ({} total)", descriptors.len());
    println!();
    for descriptor in &descriptors {
        let desc = descriptor.description.as_deref().unwrap_or("");
        let short: String = desc.chars().take(60).collect();
        let ellipsis = if desc.chars().count() > 60 { "..." } else { "" };
        println!("  {:<28} {}{}", descriptor.name, short, ellipsis);
    }

    println!();
    println!(
        "Logical operations ({} of {} resolved):",
        catalog.len(),
        LogicalTool::all().len()
    );
    println!();
    for tool in LogicalTool::all() {
        match catalog.remote_name(*tool) {
            Some(remote) => println!("  {:<16} -> {}", tool.name(), remote),
            None => println!("  {:<16} -> (no match)", tool.name()),
        }
    }

    client.close().await;
    Ok(())
}
