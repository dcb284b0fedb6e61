//! Status events for the host, carried as `ESC ] 777 ; <json> BEL`.

use std::io::Write;

use sb_core::types::StatusEvent;
use tracing::debug;

const OSC_START: &[u8] = b"\x1b]777;";
const BEL: u8 = 0x07;

/// Frame an event as an OSC 777 sequence.
pub fn encode(event: &StatusEvent) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(event)?;
    let mut frame = Vec::with_capacity(OSC_START.len() + json.len() + 1);
    frame.extend_from_slice(OSC_START);
    frame.extend_from_slice(&json);
    frame.push(BEL);
    Ok(frame)
}

/// Write and flush one event. Failures are logged and swallowed; returns
/// whether the event went out.
pub fn report<W: Write + ?Sized>(out: &mut W, event: &StatusEvent) -> bool {
    let frame = match encode(event) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(kind = event.kind(), error = %e, "status event not encodable");
            return false;
        }
    };
    match out.write_all(&frame).and_then(|()| out.flush()) {
        Ok(()) => {
            debug!(kind = event.kind(), "status event sent");
            true
        }
        Err(e) => {
            debug!(kind = event.kind(), error = %e, "status event dropped");
            false
        }
    }
}
