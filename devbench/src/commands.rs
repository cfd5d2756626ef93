// Command handlers for devbench operations

use anyhow::{bail, Result};
use devbench_orchestrator::{DevbenchService, JobTicket, VmRecord, VmStatus};
use std::time::Duration;
use tracing::debug;

use crate::cli::{Args, Command};

/// How often `--follow` polls the store for new log lines.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

/// Main command dispatcher
pub async fn execute_command(service: &DevbenchService, args: &Args) -> Result<()> {
    match &args.command {
        Command::Create { name, user, follow } => {
            debug!("Handling create command for {} ({})", name, user);
            let (record, ticket) = service.create_devbench(name, user).await?;
            println!("Creating devbench '{}' ({})", record.name, record.id);
            await_job(service, &record.id, ticket, *follow, args.json).await
        }
        Command::Activate { id, user, follow } => {
            debug!("Handling activate command for {} ({})", id, user);
            let (record, ticket) = service.activate_devbench(id, user).await?;
            println!("Activating devbench '{}' ({})", record.name, record.id);
            await_job(service, &record.id, ticket, *follow, args.json).await
        }
        Command::List { user } => {
            let records = service.list_devbenches(user.as_deref()).await?;
            print_list(&records, args.json)
        }
        Command::Logs { id } => {
            let (lines, status) = service.get_logs(id).await?;
            for line in lines {
                println!("{}", line);
            }
            println!("Status: {}", status);
            Ok(())
        }
        Command::Status { id } => {
            let record = service.get_devbench(id).await?;
            print_record(&record, args.json)
        }
        Command::Delete { id } => {
            service.delete_devbench(id).await?;
            println!("Deleted devbench {}", id);
            Ok(())
        }
        // Handled before the database is opened.
        Command::Backup => Ok(()),
    }
}

/// Keep the process (and with it the job) alive until the script is done.
async fn await_job(
    service: &DevbenchService,
    id: &str,
    ticket: JobTicket,
    follow: bool,
    json: bool,
) -> Result<()> {
    let mut printed = 0;
    let mut interval = tokio::time::interval(FOLLOW_INTERVAL);
    let wait = ticket.wait();
    tokio::pin!(wait);

    let report = loop {
        tokio::select! {
            report = &mut wait => break report,
            _ = interval.tick(), if follow => {
                printed = print_new_lines(service, id, printed).await;
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted, stopping the provisioning script...");
                service.cancel(id);
            }
        }
    };

    if follow {
        print_new_lines(service, id, printed).await;
    }

    let Some(report) = report else {
        bail!("job for devbench {} did not report back", id);
    };
    let Some(status) = report.final_status else {
        bail!("devbench {} was removed while its job was running", id);
    };

    let record = service.get_devbench(id).await?;
    print_record(&record, json)?;

    if status != VmStatus::Ready {
        bail!(
            "VM {} for devbench {} ended in status {}",
            report.kind.noun(),
            id,
            status
        );
    }
    Ok(())
}

/// Print log entries past `printed` and return the new count.
async fn print_new_lines(service: &DevbenchService, id: &str, printed: usize) -> usize {
    match service.get_devbench(id).await {
        Ok(record) => {
            for entry in record.log.iter().skip(printed) {
                println!("{}", entry);
            }
            record.log.len().max(printed)
        }
        Err(e) => {
            debug!("Could not read log of {}: {}", id, e);
            printed
        }
    }
}

fn print_record(record: &VmRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    println!("ID:       {}", record.id);
    println!("Name:     {}", record.name);
    println!("Owner:    {}", record.owner);
    println!("Status:   {}", record.status);
    if let Some(ip) = &record.ip_address {
        println!("IP:       {}", ip);
    }
    if let Some(ssh) = &record.ssh_info {
        println!("SSH:      {}", ssh);
    }
    if let Some(vnc) = &record.vnc_info {
        println!("VNC:      {}", vnc);
    }
    println!("Created:  {}", record.created_at.to_rfc3339());
    println!("Updated:  {}", record.updated_at.to_rfc3339());
    if let Some(details) = &record.details {
        println!("Details:\n{}", details);
    }
    Ok(())
}

fn print_list(records: &[VmRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No devbenches found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<12}  {:<10}  IP",
        "ID", "NAME", "OWNER", "STATUS"
    );
    for record in records {
        println!(
            "{:<36}  {:<20}  {:<12}  {:<10}  {}",
            record.id,
            record.name,
            record.owner,
            record.status.as_str(),
            record.ip_address.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
