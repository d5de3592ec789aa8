//! Optional OSC mirror (spec §6, SPEC_FULL §3): forwards `DASHBOARD`
//! events to a UDP peer as Open Sound Control messages, configured
//! per-run via `--osc <host:port>` rather than always on.

use std::net::SocketAddr;

use serde_json::Value;
use tokio::net::UdpSocket;

use crate::control::event_bus::EventBus;
use crate::control::message::ControlMessage;

/// Pad `buf` to the next 4-byte boundary with NUL bytes, as every OSC
/// string and blob field requires.
fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn osc_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    pad4(buf);
}

/// Encode a DASHBOARD block's value as a minimal OSC message: the address
/// pattern is `/speechflow/<block_id>`, the argument is a float32 if the
/// value is numeric, otherwise its JSON text.
fn encode_osc_message(block_id: &str, value: &serde_json::Value) -> Vec<u8> {
    let mut buf = Vec::new();
    osc_string(&mut buf, &format!("/speechflow/{block_id}"));

    if let Some(n) = value.as_f64() {
        osc_string(&mut buf, ",f");
        buf.extend_from_slice(&(n as f32).to_be_bytes());
    } else {
        osc_string(&mut buf, ",s");
        osc_string(&mut buf, &value.to_string());
    }
    buf
}

/// Run the OSC mirror until the bus's sender is dropped. Only
/// `DASHBOARD` events are forwarded, matching spec §6.
pub async fn run_mirror(bus: EventBus, target: SocketAddr) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    let mut rx = bus.subscribe();
    tracing::info!(%target, "OSC mirror started");

    while let Ok(message) = rx.recv().await {
        if let ControlMessage::Dashboard { args, .. } = message {
            let Some(id) = args.get(1).and_then(Value::as_str) else {
                continue;
            };
            let value = args.get(3).cloned().unwrap_or(Value::Null);
            let packet = encode_osc_message(id, &value);
            if let Err(err) = socket.send(&packet).await {
                tracing::warn!(%err, "OSC mirror send failed");
            }
        }
    }
    Ok(())
}
