//! Reset command - ECU reset

use anyhow::Result;
use canboot_uds::{wait_for, Notification};
use clap::ValueEnum;

use super::Session;
use crate::output::OutputContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ResetKind {
    /// Restart into the bootloader (0x60)
    #[default]
    Uds,
    /// Restart into the application (0x03)
    Software,
}

/// Reset the ECU
pub async fn reset(session: &Session, kind: ResetKind, ctx: &OutputContext) -> Result<()> {
    let mut notifications = session.handle.subscribe();
    match kind {
        ResetKind::Uds => session.handle.ecu_uds_reset().await?,
        ResetKind::Software => session.handle.ecu_software_reset().await?,
    }

    let accepted = session
        .within_deadline(
            "ECU reset",
            wait_for(&mut notifications, |n| {
                ctx.status(n);
                match n {
                    Notification::ResetCompleted { success, .. } => Some(*success),
                    _ => None,
                }
            }),
        )
        .await?;

    if !accepted {
        anyhow::bail!("ECU rejected the reset");
    }
    Ok(())
}
