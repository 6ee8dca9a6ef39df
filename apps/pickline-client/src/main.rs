mod cli;

use anyhow::{bail, Result};
use clap::Parser;
use pickline_client::{Action, Notice, PickClient, SessionDriver};
use pickline_core::{ControlEvent, EventKind};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&cli.log_filter))
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let driver = match (cli.identity.token, cli.identity.session) {
        (Some(token), session) => SessionDriver::mobile(token, session),
        (None, Some(session)) => SessionDriver::desktop(session),
        (None, None) => bail!("either --session or --token is required"),
    };
    let mut client = PickClient::spawn(cli.server, driver);
    wait_for_sync(&mut client).await?;

    let outcome = match cli.command {
        Commands::Watch => watch(&mut client).await,
        Commands::Pick {
            item,
            action,
            times,
        } => {
            let mut outcome = Ok(());
            for _ in 0..times {
                let action = Action::Pick {
                    item_id: item,
                    action: action.into(),
                };
                outcome = perform(&mut client, action).await;
                if outcome.is_err() {
                    break;
                }
            }
            outcome
        }
        Commands::Pack {
            order,
            material,
            weight,
            send_email,
        } => {
            let action = Action::Pack {
                order_id: order,
                material_id: material,
                weight,
                send_email,
            };
            perform(&mut client, action).await
        }
        Commands::Navigate { order } => {
            perform(&mut client, Action::Navigate { order_id: order }).await
        }
    };

    client.shutdown().await?;
    outcome
}

async fn wait_for_sync(client: &mut PickClient) -> Result<()> {
    while let Some(notice) = client.next_notice().await {
        print_notice(&notice);
        match notice {
            Notice::Synced { .. } => return Ok(()),
            Notice::Rejected { message, .. } => bail!("join rejected: {message}"),
            _ => {}
        }
    }
    bail!("connection closed before the session loaded")
}

async fn perform(client: &mut PickClient, action: Action) -> Result<()> {
    let request_id = client.submit(action).await?;
    while let Some(notice) = client.next_notice().await {
        print_notice(&notice);
        if let Some(result) = settles(&notice, request_id) {
            return result;
        }
    }
    bail!("connection closed before request {request_id} settled")
}

fn settles(notice: &Notice, request_id: Uuid) -> Option<Result<()>> {
    match notice {
        Notice::Applied(event) if event.request_id == Some(request_id) => Some(Ok(())),
        Notice::Acknowledged(id) if *id == request_id => Some(Ok(())),
        Notice::Rejected {
            request_id: Some(id),
            message,
            ..
        } if *id == request_id => Some(Err(anyhow::anyhow!("request rejected: {message}"))),
        _ => None,
    }
}

async fn watch(client: &mut PickClient) -> Result<()> {
    loop {
        tokio::select! {
            notice = client.next_notice() => match notice {
                Some(notice) => print_notice(&notice),
                None => return Ok(()),
            },
            _ = signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::Synced { sequence } => println!("synced at sequence {sequence}"),
        Notice::Applied(event) => {
            let line = match &event.kind {
                EventKind::ItemDelta {
                    item,
                    order,
                    session,
                    ..
                } => format!(
                    "item {} {}/{} | order {} {:.0}% | session {}/{} packed, {:.0}% picked",
                    item.id,
                    item.picked_quantity,
                    item.quantity,
                    order.order_number,
                    order.picked_percentage * 100.0,
                    session.packed_orders,
                    session.total_orders,
                    session.picked_percentage * 100.0,
                ),
                EventKind::OrderPacked {
                    order,
                    session,
                    low_stock_warning,
                    ..
                } => {
                    let mut line = format!(
                        "order {} packed | session {}/{} packed",
                        order.order_number, session.packed_orders, session.total_orders
                    );
                    if let Some(warning) = low_stock_warning {
                        line.push_str(&format!(" | {warning}"));
                    }
                    line
                }
                EventKind::Navigate { order_id } => format!("now on order {order_id}"),
                EventKind::SessionCompleted { .. } => "session completed".to_string(),
                EventKind::SessionCancelled { .. } => "session cancelled".to_string(),
            };
            println!("[{}] {line}", event.sequence);
        }
        Notice::Acknowledged(id) => println!("request {id} already applied"),
        Notice::Rejected { kind, message, .. } => {
            eprintln!("rejected ({}): {message}", kind.as_str())
        }
        Notice::Resyncing { expected, received } => {
            println!("missed events (expected {expected}, got {received}); resyncing")
        }
        Notice::Control(control) => match control {
            ControlEvent::PhoneConnected => println!("phone connected"),
            ControlEvent::PhoneDisconnected => println!("phone disconnected"),
            ControlEvent::PackingPhotoUploaded {
                order_id,
                photo_url,
            } => println!("photo for order {order_id}: {photo_url}"),
            ControlEvent::Superseded { role } => {
                println!("{role} connection taken over by another device")
            }
        },
        Notice::Reconnecting { attempt } => println!("reconnecting (attempt {attempt})"),
    }
}
