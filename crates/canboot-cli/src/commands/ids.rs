//! Ids command - show the identifiers in use

use anyhow::Result;

use super::Session;
use crate::output::{identifier_pairs, OutputContext};

pub async fn ids(session: &Session, ctx: &OutputContext) -> Result<()> {
    let snapshot = session.handle.snapshot().await?;

    let mut pairs = identifier_pairs(&snapshot.identifiers);
    pairs.push(("Byte order", snapshot.byte_order.to_string()));
    pairs.push(("Port", session.port.name()));
    pairs.push(("State", snapshot.state.to_string()));
    ctx.print_kv(&pairs);
    Ok(())
}
