//! # Outbound Frame Queue
//!
//! A single serialized path to the tunnel channel's writer, shared by the
//! demux loop, the HTTP replay workers, and the WebSocket bridge workers.
//! Every producer holds a cloned `mpsc::UnboundedSender` and only the one
//! task draining the other end ever touches the WebSocket sink, so two
//! frames can never interleave on the wire.

use tokio::sync::mpsc;

use crate::protocol::ControlMessage;

/// One unit of outbound traffic: either a JSON control message or a
/// binary `CHNK` envelope payload bound for a specific request id.
#[derive(Debug)]
pub enum OutboundFrame {
    Control(ControlMessage),
    Chunk { id: String, payload: Vec<u8> },
}

pub type OutboundTx = mpsc::UnboundedSender<OutboundFrame>;

/// Sends a control message, ignoring the error that results from the
/// writer task already having shut down — a worker left over from a
/// closed session just has nowhere to send and gives up quietly.
pub fn send_control(tx: &OutboundTx, msg: ControlMessage) {
    let _ = tx.send(OutboundFrame::Control(msg));
}

pub fn send_chunk(tx: &OutboundTx, id: String, payload: Vec<u8>) {
    let _ = tx.send(OutboundFrame::Chunk { id, payload });
}
