//! Check command - is the bootloader running?

use anyhow::Result;
use canboot_uds::{wait_for, Notification};

use super::Session;
use crate::output::OutputContext;

/// Read the fingerprint DID; only the bootloader answers it
pub async fn check(session: &Session, ctx: &OutputContext) -> Result<bool> {
    let mut notifications = session.handle.subscribe();
    session.handle.check_state().await?;

    let active = session
        .within_deadline(
            "fingerprint read",
            wait_for(&mut notifications, |n| {
                ctx.status(n);
                match n {
                    Notification::BootloaderActive { active } => Some(*active),
                    _ => None,
                }
            }),
        )
        .await?;

    if !active {
        ctx.warn("Bootloader is not active");
    }
    Ok(active)
}
