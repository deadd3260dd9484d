//! A reliable datagram transport layered on top of unreliable UDP, built for
//!  moving defined-length byte payloads (up to tens of megabytes) between peers
//!  with selective-repeat recovery, per-destination pacing and explicit
//!  end-of-transfer acknowledgement.
//!
//! ## Design goals
//!
//! * The protocol is symmetric peer-to-peer: every endpoint may send and
//!   receive concurrent transfers to/from many peers through a single UDP
//!   socket
//! * The abstraction is *transfers* (one byte payload per transfer, identified
//!   by a per-peer 32-bit id) rather than streams of bytes
//! * Payloads are split into fixed-size fragments; fragments may arrive in any
//!   order, and reassembly is keyed by fragment sequence number
//! * Recovery is receiver-driven: the receiver periodically scans its
//!   reassembly buffer for holes and requests exactly the missing fragments
//!   (selective repeat), so the sender re-sends only what was lost
//! * Outgoing fragments are paced against a configured bandwidth estimate
//!   rather than being blasted in one burst - this is flow shaping, not
//!   congestion control
//! * Transfer completion is acknowledged explicitly: the receiver announces a
//!   fully reassembled transfer with FIN, and retries FIN until the sender
//!   confirms with ACK, so the final handshake survives loss in either
//!   direction
//! * Per-peer session state is garbage-collected on idle timeout, so an
//!   endpoint that talks to many short-lived peers does not accumulate state
//!
//! ## Wire format
//!
//! Every UDP payload is the integrity envelope around an inner packet: the
//!  inner packet is prefixed with a 16-bit one's-complement checksum, and the
//!  whole buffer is then XOR-obfuscated against its own leading word (see
//!  [`envelope`]). All multi-byte integers are big-endian.
//!
//! Inner packet header (6 bytes):
//! ```ascii
//! 0: packet type (u8): 01 PSH, 02 REQ, 03 FIN, 04 ACK, 05 ERR
//! 1: reserved (u8), must be 0
//! 2: transfer id (u32)
//! ```
//!
//! Payload by packet type:
//!
//! *PSH* - one fragment of a transfer:
//! ```ascii
//! 0: fragment sequence number (u16)
//! 2: sender's burst window hint (u16)
//! 4: total fragment count of the transfer (u16)
//! 6: fragment data (up to MAX_PACKET_PAYLOAD bytes; only the last fragment
//!     of a transfer may be shorter)
//! ```
//!
//! *REQ* - selective-repeat request, sent by the receiver for the fragments
//!  it is missing:
//! ```ascii
//! 0: (repeated) u16 entries of the run-encoded sequence list (see [`seq_list`])
//! ```
//!
//! *FIN* - sent by the receiver once all fragments of a transfer are stored;
//!  retried once per second until acknowledged:
//! ```ascii
//! [no payload]
//! ```
//!
//! *ACK* - sent by the sender to confirm a control packet (in practice only
//!  FIN):
//! ```ascii
//! 0: acknowledged packet type (u8)
//! ```
//!
//! *ERR* - protocol-level error notification:
//! ```ascii
//! 0: error code (u16): 0000 = transfer id not found
//! ```
//!
//! ## Recovery cycle
//!
//! The sender fragments a payload, enqueues an opening window of fragments and
//!  drains the queue on a pacing interval derived from the bandwidth estimate.
//!  Each incoming PSH (re)arms a short hole-check delay on the receiver; when
//!  it fires, the receiver either announces completion with FIN or requests the
//!  first batch of missing fragments with REQ and re-arms the check one RTT
//!  later. Requested sequence numbers are suppressed against the previous
//!  request for one RTT so that REQs duplicated by the network do not trigger
//!  duplicate re-sends. A sender whose queue has drained without hearing from
//!  the peer re-sends its last burst on an escalating schedule and gives the
//!  transfer up after three silent rounds.

pub mod config;
pub mod end_point;
pub mod envelope;
pub mod errors;
pub mod event_dispatcher;
pub mod packet_header;
pub mod seq_list;
pub mod send_pipeline;
pub mod session_table;

mod receive_session;
mod safe_converter;
mod send_session;

pub use config::FlowConfig;
pub use end_point::{DrainCallback, EndPoint};
pub use errors::SendError;
pub use event_dispatcher::EventDispatcher;
pub use send_pipeline::SendSocket;
