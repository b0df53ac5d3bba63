//! Collect command - fuel and temperature telemetry from every node

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use canboot_uds::Collector;

use super::Session;
use crate::output::{OutputContext, ReadingRow};

pub async fn collect(session: &Session, window: Duration, ctx: &OutputContext) -> Result<()> {
    let snapshot = session.handle.snapshot().await?;
    let mut collector = Collector::new(
        &snapshot.identifiers,
        snapshot.byte_order,
        session.config.collector,
    );

    ctx.info(&format!("Polling nodes for {:.1}s...", window.as_secs_f32()));
    collector.run(Arc::clone(&session.port), window).await?;

    let rows: Vec<ReadingRow> = collector.readings().iter().map(ReadingRow::from).collect();
    ctx.print(&rows);
    Ok(())
}
