//! Detect command - find the bootloader by listening to the bus

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::Session;
use crate::config::save_identifiers;
use crate::output::{identifier_pairs, CandidateRow, OutputContext};

pub async fn detect(
    session: &Session,
    window: Duration,
    apply: bool,
    save: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let identifiers = session.handle.identifiers().await?;
    ctx.info(&format!("Listening for {:.1}s...", window.as_secs_f32()));

    let candidates =
        canboot_uds::detect(Arc::clone(&session.port), &identifiers, window).await?;
    let rows: Vec<CandidateRow> = candidates.iter().map(CandidateRow::from).collect();
    ctx.print(&rows);

    if !apply {
        return Ok(());
    }
    let Some(best) = candidates.first() else {
        anyhow::bail!("No node heard, nothing to apply");
    };

    session.handle.apply_candidate(best.address, best.tester).await?;
    let identifiers = session.handle.identifiers().await?;
    ctx.success(&format!(
        "Using ECU 0x{:02X} with tester 0x{:02X}",
        best.address, best.tester
    ));
    ctx.print_kv(&identifier_pairs(&identifiers));

    if save {
        save_identifiers(&session.config_path, &identifiers)?;
        ctx.info(&format!("Saved to {}", session.config_path.display()));
    }
    Ok(())
}
