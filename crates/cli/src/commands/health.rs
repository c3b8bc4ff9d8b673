//! Agent health query

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::AgentClient;
use crate::output::{color_status, format_timestamp, print_json, print_rows, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Checked")]
    checked: String,
}

pub async fn show_health(client: &AgentClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    if let OutputFormat::Json = format {
        return print_json(&health);
    }

    let overall = serde_json::to_value(health.status)?
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    println!("{} {}", "Agent status:".bold(), color_status(&overall));
    println!();

    let mut names: Vec<&String> = health.components.keys().collect();
    names.sort();

    let rows = names
        .into_iter()
        .map(|name| {
            let component = &health.components[name];
            let status = serde_json::to_value(component.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            ComponentRow {
                name: name.clone(),
                status: color_status(&status),
                message: component.message.clone().unwrap_or_default(),
                checked: format_timestamp(component.last_check_timestamp),
            }
        })
        .collect();

    print_rows(rows, "Agent reported no components");
    Ok(())
}
