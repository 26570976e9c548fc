use std::collections::BTreeMap;
use std::time::Duration;

use mavlink::common::{MavMessage, PARAM_REQUEST_LIST_DATA};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ProtocolError;
use crate::session::Session;

/// Whole-dump window and the silence that ends it early.
pub const DUMP_WINDOW: Duration = Duration::from_secs(5);
pub const DUMP_IDLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub index: u16,
    pub name: String,
    pub value: f32,
}

pub fn param_name(id: &[u8]) -> String {
    let end = id.iter().position(|b| *b == 0).unwrap_or(id.len());
    String::from_utf8_lossy(&id[..end]).into_owned()
}

/// Requests the full parameter list. Returns what arrived, sorted by index,
/// once every announced value is in, the link goes quiet for `idle`, or
/// `window` runs out.
pub async fn fetch_params(session: &Session, window: Duration, idle: Duration) -> Result<Vec<Param>, ProtocolError> {
    let mut ex = session.exchange().await?;
    let target = ex.target();
    ex.send(&MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
        target_system: target.system,
        target_component: target.component,
    }))?;
    info!("parameter list requested");

    let deadline = Instant::now() + window;
    let mut got: BTreeMap<u16, Param> = BTreeMap::new();
    let mut expected: Option<u16> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = remaining.min(idle);
        let next = ex
            .wait_for("PARAM_VALUE", wait, |msg| match msg {
                MavMessage::PARAM_VALUE(p) => Some(p.clone()),
                _ => None,
            })
            .await;
        match next {
            Ok(p) => {
                expected = Some(p.param_count);
                let name = param_name(&p.param_id);
                debug!("param {} = {}", name, p.param_value);
                got.insert(p.param_index, Param { index: p.param_index, name, value: p.param_value });
                if expected.is_some_and(|n| got.len() >= n as usize) {
                    break;
                }
            }
            Err(e) if e.is_timeout() => break,
            Err(e) => return Err(e),
        }
    }

    info!("received {}/{} parameters", got.len(), expected.map_or("?".to_string(), |n| n.to_string()));
    Ok(got.into_values().collect())
}
