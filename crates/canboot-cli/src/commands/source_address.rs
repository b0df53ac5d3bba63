//! Source address commands - read and rewrite the ECU's J1939 address

use anyhow::{Context, Result};
use canboot_uds::{wait_for, Notification};

use super::Session;
use crate::config::save_identifiers;
use crate::output::{identifier_pairs, OutputContext};

pub async fn read_source_address(session: &Session, ctx: &OutputContext) -> Result<u8> {
    let mut notifications = session.handle.subscribe();
    session.handle.read_source_address().await?;

    let (address, success) = wait_for(&mut notifications, |n| {
        ctx.status(n);
        match n {
            Notification::SourceAddressRead { address, success } => Some((*address, *success)),
            _ => None,
        }
    })
    .await?;

    if !success {
        anyhow::bail!("Source address read failed");
    }
    ctx.print_kv(&[("Source address", format!("0x{:02X}", address))]);
    Ok(address)
}

/// Write a new address; on success the identifiers follow the ECU
pub async fn write_source_address(
    session: &Session,
    address: u16,
    save: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let mut notifications = session.handle.subscribe();
    session
        .handle
        .write_source_address(address)
        .await
        .context("Source address write refused")?;

    let success = wait_for(&mut notifications, |n| {
        ctx.status(n);
        match n {
            Notification::SourceAddressApplied { success, .. } => Some(*success),
            _ => None,
        }
    })
    .await?;

    if !success {
        anyhow::bail!("ECU did not confirm source address 0x{:02X}", address);
    }

    let identifiers = session.handle.identifiers().await?;
    ctx.print_kv(&identifier_pairs(&identifiers));
    if save {
        save_identifiers(&session.config_path, &identifiers)?;
        ctx.info(&format!("Saved to {}", session.config_path.display()));
    }
    Ok(())
}
