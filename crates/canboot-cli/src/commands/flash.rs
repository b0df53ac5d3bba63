//! Flash command - firmware download

use std::path::Path;

use anyhow::{Context, Result};
use canboot_uds::{wait_for, wait_while_active, BootloaderState, Notification, Severity};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use super::Session;
use crate::output::OutputContext;

/// Download `file_path` into the ECU
///
/// With `auto_reset` the ECU is first restarted into the bootloader and, after
/// a successful download, back into the application.
pub async fn flash(
    session: &Session,
    file_path: &Path,
    auto_reset: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let handle = &session.handle;

    ctx.info(&format!("Reading firmware from {}...", file_path.display()));
    let len = handle
        .load_firmware(file_path)
        .await
        .with_context(|| format!("Failed to load firmware: {}", file_path.display()))?;
    ctx.info(&format!("Firmware size: {} bytes", len));

    if auto_reset {
        ctx.info("Restarting ECU into the bootloader...");
        handle.ecu_uds_reset().await?;
        tokio::time::sleep(session.config.timeouts.auto_reset_delay()).await;
        // The bootloader may come up without answering the reset
        if handle.state().await? != BootloaderState::Ready {
            handle.reset_state().await?;
        }
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );
    if ctx.quiet {
        pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }

    let mut notifications = handle.subscribe();
    handle.start().await.context("Failed to start download")?;

    let idle = session.config.timeouts.transfer_idle();
    let outcome = wait_while_active(&mut notifications, idle, |n| match n {
        Notification::Progress { sent, total } => {
            pb.set_length(*total as u64);
            pb.set_position(*sent as u64);
            None
        }
        Notification::StateChanged(state) => {
            pb.set_message(state.to_string());
            None
        }
        Notification::Status { severity, message } if !ctx.quiet => {
            let line = match severity {
                Severity::Info => message.as_str().normal(),
                Severity::Success => message.as_str().green(),
                Severity::Error => message.as_str().red(),
            };
            pb.println(line.to_string());
            None
        }
        Notification::Finished { success } => Some(*success),
        _ => None,
    })
    .await?;

    let Some(success) = outcome else {
        pb.abandon_with_message("ECU stopped answering");
        handle.reset_state().await?;
        anyhow::bail!(
            "No download activity for {:.1}s, giving up",
            idle.as_secs_f32()
        );
    };
    if !success {
        pb.abandon_with_message("Flash failed!");
        handle.reset_state().await?;
        anyhow::bail!("Firmware download failed");
    }
    pb.finish_with_message("Complete!");

    if auto_reset {
        ctx.info("Restarting ECU into the application...");
        let mut notifications = handle.subscribe();
        handle.ecu_software_reset().await?;
        let accepted = session
            .within_deadline(
                "software reset",
                wait_for(&mut notifications, |n| match n {
                    Notification::ResetCompleted { success, .. } => Some(*success),
                    _ => None,
                }),
            )
            .await;
        match accepted {
            Ok(true) => {}
            Ok(false) => ctx.warn("ECU rejected the software reset"),
            Err(e) => ctx.warn(&e.to_string()),
        }
    }

    ctx.success("Firmware update completed successfully");
    Ok(())
}
