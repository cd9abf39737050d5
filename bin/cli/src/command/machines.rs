//! `connect`/`disconnect`/`machines`/`doctor`: the [SUPPLEMENT]
//! local-control surface, always against this operator's own `cilod`.

use colored::Colorize;
use comfy_table::Table;

use crate::client;

pub async fn connect(host: &str, address: Option<&str>) -> anyhow::Result<()> {
  let machine = client::local()?.machines_connect(host, address).await?;
  println!("{} {} ({})", "connected".green().bold(), machine.host, machine.tunnel_ip);
  Ok(())
}

pub async fn disconnect(host: Option<&str>) -> anyhow::Result<()> {
  let client = client::local()?;
  match host {
    Some(host) => {
      client.machines_disconnect(host).await?;
      println!("{} {host}", "disconnected".yellow().bold());
    }
    None => {
      let machines = client.list_machines().await?;
      for machine in &machines {
        client.machines_disconnect(&machine.host).await?;
        println!("{} {}", "disconnected".yellow().bold(), machine.host);
      }
    }
  }
  Ok(())
}

pub async fn list() -> anyhow::Result<()> {
  let machines = client::local()?.list_machines().await?;
  let mut table = Table::new();
  table.set_header(vec!["HOST", "STATUS", "TUNNEL IP", "CONNECTED AT"]);
  for machine in &machines {
    table.add_row(vec![
      machine.host.clone(),
      format!("{:?}", machine.status),
      machine.tunnel_ip.clone(),
      machine.connected_at.to_rfc3339(),
    ]);
  }
  println!("{table}");
  Ok(())
}

pub async fn doctor(fix: bool) -> anyhow::Result<()> {
  let drift = client::local()?.doctor(fix).await?;
  if drift.is_empty() {
    println!("{}", "no drift detected".green().bold());
    return Ok(());
  }
  let verb = if fix { "fixed" } else { "found" };
  for item in &drift {
    println!("{} {item}", verb.yellow().bold());
  }
  Ok(())
}
