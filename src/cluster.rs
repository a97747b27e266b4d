//! Parent ↔ worker IPC.
//!
//! Each worker shares a `socketpair` with the parent. Both ends are
//! ordinary connections in their owner's reactor, driven by the internal
//! protocols below. Frames are little-endian:
//!
//! ```text
//! u32 payload_len | u16 type | u16 flags | u16 channel_len | u32 msg_len |
//! i32 filter | u8 is_json | u8 pad | channel bytes | msg bytes
//! ```
//!
//! Payloads above the configured maximum are split into continuation
//! frames and reassembled in pipe order. The parent keeps a mirror of
//! worker subscriptions (exact names and default-glob patterns) used only
//! to pick forwarding targets for publications.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::metrics;
use crate::packet::Packet;
use crate::pattern::glob_match;
use crate::protocol::{Protocol, Shutdown};
use crate::runtime::Core;
use crate::state::StateEvent;
use crate::uuid::Uuid;

pub(crate) const HEADER_LEN: usize = 20;

pub(crate) const FLAG_CONTINUATION: u16 = 0x0001;
pub(crate) const FLAG_ROOT: u16 = 0x0002;

/// Frame discriminator on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameType {
    Publish = 1,
    Subscribe = 2,
    Unsubscribe = 3,
    PatternSubscribe = 4,
    PatternUnsubscribe = 5,
    Shutdown = 6,
    Ping = 7,
}

impl FrameType {
    fn from_u16(raw: u16) -> Option<FrameType> {
        Some(match raw {
            1 => FrameType::Publish,
            2 => FrameType::Subscribe,
            3 => FrameType::Unsubscribe,
            4 => FrameType::PatternSubscribe,
            5 => FrameType::PatternUnsubscribe,
            6 => FrameType::Shutdown,
            7 => FrameType::Ping,
            _ => return None,
        })
    }
}

/// One logical frame (after continuation reassembly).
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) ftype: FrameType,
    pub(crate) flags: u16,
    pub(crate) filter: i32,
    pub(crate) is_json: bool,
    pub(crate) channel: Bytes,
    pub(crate) msg: Bytes,
}

impl Frame {
    pub(crate) fn publish(channel: Bytes, msg: Bytes, is_json: bool, root: bool) -> Frame {
        Frame {
            ftype: FrameType::Publish,
            flags: if root { FLAG_ROOT } else { 0 },
            filter: 0,
            is_json,
            channel,
            msg,
        }
    }

    pub(crate) fn control(ftype: FrameType, channel: Bytes) -> Frame {
        Frame {
            ftype,
            flags: 0,
            filter: 0,
            is_json: false,
            channel,
            msg: Bytes::new(),
        }
    }

    /// Encode, splitting into continuation frames above `max_payload`.
    pub(crate) fn encode(&self, max_payload: usize, out: &mut BytesMut) -> Result<(), Error> {
        if self.channel.len() > u16::MAX as usize || self.channel.len() >= max_payload {
            return Err(Error::ClusterIpc("channel name too long".into()));
        }

        let first_budget = max_payload - self.channel.len();
        if self.msg.len() <= first_budget {
            encode_one(out, self, self.flags, &self.channel, &self.msg);
            return Ok(());
        }

        // First frame carries the channel; continuations carry msg chunks.
        let mut offset = first_budget;
        encode_one(
            out,
            self,
            self.flags | FLAG_CONTINUATION,
            &self.channel,
            &self.msg[..offset],
        );
        while offset < self.msg.len() {
            let end = usize::min(offset + max_payload, self.msg.len());
            let flags = if end == self.msg.len() {
                self.flags
            } else {
                self.flags | FLAG_CONTINUATION
            };
            encode_one(out, self, flags, &[], &self.msg[offset..end]);
            offset = end;
        }
        Ok(())
    }
}

fn encode_one(out: &mut BytesMut, frame: &Frame, flags: u16, channel: &[u8], msg: &[u8]) {
    out.reserve(HEADER_LEN + channel.len() + msg.len());
    out.put_u32_le((channel.len() + msg.len()) as u32);
    out.put_u16_le(frame.ftype as u16);
    out.put_u16_le(flags);
    out.put_u16_le(channel.len() as u16);
    out.put_u32_le(msg.len() as u32);
    out.put_i32_le(frame.filter);
    out.put_u8(frame.is_json as u8);
    out.put_u8(0);
    out.put_slice(channel);
    out.put_slice(msg);
    metrics::CLUSTER_FRAMES_SENT.increment();
}

/// Incremental frame parser with continuation reassembly. One per pipe;
/// pipe FIFO ordering means at most one message is ever in flight.
pub(crate) struct FrameDecoder {
    buf: BytesMut,
    partial: Option<Frame>,
}

impl FrameDecoder {
    pub(crate) fn new() -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            partial: None,
        }
    }

    /// Feed raw bytes; completed logical frames are appended to `out`.
    pub(crate) fn feed(&mut self, data: &[u8], out: &mut Vec<Frame>) -> Result<(), Error> {
        self.buf.extend_from_slice(data);

        loop {
            if self.buf.len() < HEADER_LEN {
                return Ok(());
            }
            let payload_len =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < HEADER_LEN + payload_len {
                return Ok(());
            }

            let mut header = self.buf.split_to(HEADER_LEN);
            header.advance(4);
            let raw_type = header.get_u16_le();
            let flags = header.get_u16_le();
            let channel_len = header.get_u16_le() as usize;
            let msg_len = header.get_u32_le() as usize;
            let filter = header.get_i32_le();
            let is_json = header.get_u8() != 0;

            if channel_len + msg_len != payload_len {
                return Err(Error::ClusterIpc("frame length mismatch".into()));
            }
            let ftype = FrameType::from_u16(raw_type)
                .ok_or_else(|| Error::ClusterIpc(format!("unknown frame type {raw_type}")))?;

            let channel = self.buf.split_to(channel_len).freeze();
            let msg = self.buf.split_to(msg_len).freeze();
            metrics::CLUSTER_FRAMES_RECEIVED.increment();

            let continued = flags & FLAG_CONTINUATION != 0;
            match self.partial.take() {
                Some(mut partial) => {
                    // Continuation of the in-flight message.
                    let mut merged = BytesMut::from(&partial.msg[..]);
                    merged.extend_from_slice(&msg);
                    partial.msg = merged.freeze();
                    if continued {
                        self.partial = Some(partial);
                    } else {
                        out.push(partial);
                    }
                }
                None => {
                    let frame = Frame {
                        ftype,
                        flags: flags & !FLAG_CONTINUATION,
                        filter,
                        is_json,
                        channel,
                        msg,
                    };
                    if continued {
                        self.partial = Some(frame);
                    } else {
                        out.push(frame);
                    }
                }
            }
        }
    }
}

// ── Parent-side mirror table ───────────────────────────────────────

/// Which workers subscribed to what. Forwarding-only metadata; actual
/// delivery happens in each worker's own registry.
pub(crate) struct Mirror {
    channels: HashMap<Bytes, HashSet<usize>>,
    patterns: HashMap<Bytes, HashSet<usize>>,
}

impl Mirror {
    pub(crate) fn new() -> Mirror {
        Mirror {
            channels: HashMap::new(),
            patterns: HashMap::new(),
        }
    }

    pub(crate) fn subscribe(&mut self, worker: usize, channel: Bytes, pattern: bool) {
        let map = if pattern {
            &mut self.patterns
        } else {
            &mut self.channels
        };
        map.entry(channel).or_default().insert(worker);
    }

    pub(crate) fn unsubscribe(&mut self, worker: usize, channel: &Bytes, pattern: bool) {
        let map = if pattern {
            &mut self.patterns
        } else {
            &mut self.channels
        };
        if let Some(set) = map.get_mut(channel) {
            set.remove(&worker);
            if set.is_empty() {
                map.remove(channel);
            }
        }
    }

    /// Remove every entry for a dead worker.
    pub(crate) fn drop_worker(&mut self, worker: usize) {
        self.channels.retain(|_, set| {
            set.remove(&worker);
            !set.is_empty()
        });
        self.patterns.retain(|_, set| {
            set.remove(&worker);
            !set.is_empty()
        });
    }

    /// Workers that should receive a publication on `channel`.
    pub(crate) fn targets(&self, channel: &[u8]) -> HashSet<usize> {
        let mut out = HashSet::new();
        if let Some(set) = self.channels.get(channel) {
            out.extend(set.iter().copied());
        }
        for (pattern, set) in &self.patterns {
            if glob_match(pattern, channel) {
                out.extend(set.iter().copied());
            }
        }
        out
    }
}

// ── Cluster runtime state ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Single-process mode; no pipes exist.
    Single = 0,
    /// The root process: owns the mirror and fans out.
    Master = 1,
    /// A forked worker: one pipe to the parent.
    Worker = 2,
}

/// A live worker as seen from the parent.
pub(crate) struct WorkerLink {
    pub(crate) index: usize,
    pub(crate) pid: libc::pid_t,
    pub(crate) uuid: Uuid,
}

pub(crate) struct Cluster {
    role: AtomicU8,
    parent_pid: AtomicI32,
    /// Worker side: the pipe to the parent.
    pipe: Mutex<Uuid>,
    /// Master side: one link per live worker.
    pub(crate) links: Mutex<Vec<WorkerLink>>,
    pub(crate) mirror: Mutex<Mirror>,
}

impl Cluster {
    pub(crate) fn new() -> Cluster {
        Cluster {
            role: AtomicU8::new(Role::Single as u8),
            parent_pid: AtomicI32::new(0),
            pipe: Mutex::new(Uuid::INVALID),
            links: Mutex::new(Vec::new()),
            mirror: Mutex::new(Mirror::new()),
        }
    }

    pub(crate) fn role(&self) -> Role {
        match self.role.load(Ordering::Acquire) {
            1 => Role::Master,
            2 => Role::Worker,
            _ => Role::Single,
        }
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub(crate) fn parent_pid(&self) -> libc::pid_t {
        self.parent_pid.load(Ordering::Acquire)
    }

    pub(crate) fn set_parent_pid(&self, pid: libc::pid_t) {
        self.parent_pid.store(pid, Ordering::Release);
    }

    pub(crate) fn set_pipe(&self, uuid: Uuid) {
        *self.pipe.lock().unwrap() = uuid;
    }

    pub(crate) fn pipe(&self) -> Uuid {
        *self.pipe.lock().unwrap()
    }
}

// ── Frame transmission helpers ─────────────────────────────────────

pub(crate) fn send_frame(core: &Arc<Core>, uuid: Uuid, frame: &Frame) {
    let mut buf = BytesMut::new();
    if let Err(err) = frame.encode(core.config().cluster_max_payload, &mut buf) {
        log::warn!("cluster frame dropped: {err}");
        return;
    }
    if core.write2(uuid, Packet::from_bytes(buf.freeze())).is_err() {
        log::warn!("cluster pipe write failed (uuid {uuid})");
    }
}

/// Master: forward a publication to every mirror-matching worker, minus
/// the originating one.
pub(crate) fn fan_out(
    core: &Arc<Core>,
    channel: &Bytes,
    msg: &Bytes,
    is_json: bool,
    except: Option<usize>,
) {
    let targets = core.cluster().mirror.lock().unwrap().targets(channel);
    if targets.is_empty() {
        return;
    }
    let links = core.cluster().links.lock().unwrap();
    for link in links.iter() {
        if Some(link.index) == except || !targets.contains(&link.index) {
            continue;
        }
        let frame = Frame::publish(channel.clone(), msg.clone(), is_json, false);
        send_frame(core, link.uuid, &frame);
    }
}

/// Master: tell every worker to begin shutdown.
pub(crate) fn broadcast_shutdown(core: &Arc<Core>) {
    let links = core.cluster().links.lock().unwrap();
    for link in links.iter() {
        send_frame(
            core,
            link.uuid,
            &Frame::control(FrameType::Shutdown, Bytes::new()),
        );
    }
}

// ── Pipe protocols ─────────────────────────────────────────────────

const PIPE_READ_CHUNK: usize = 16 * 1024;

/// Worker end of the pipe: receives forwarded publications and control
/// frames from the parent.
pub(crate) struct WorkerPipe {
    decoder: Mutex<FrameDecoder>,
}

impl WorkerPipe {
    pub(crate) fn new() -> WorkerPipe {
        WorkerPipe {
            decoder: Mutex::new(FrameDecoder::new()),
        }
    }
}

impl Protocol for WorkerPipe {
    fn on_data(&self, core: &Arc<Core>, uuid: Uuid) {
        let mut frames = Vec::new();
        if read_frames(core, uuid, &self.decoder, &mut frames).is_err() {
            core.force_close(uuid);
            return;
        }
        for frame in frames {
            match frame.ftype {
                FrameType::Publish => {
                    core.registry().deliver_local(
                        core,
                        frame.filter,
                        frame.channel,
                        frame.msg,
                        frame.is_json,
                    );
                }
                FrameType::Shutdown => core.stop(),
                FrameType::Ping => {}
                other => {
                    log::debug!("worker pipe ignoring frame {other:?}");
                }
            }
        }
    }

    fn on_shutdown(&self, _core: &Arc<Core>, _uuid: Uuid) -> Shutdown {
        // The pipe stays up through the drain so the parent can still
        // reach this worker; it is force-closed last.
        Shutdown::Ignore
    }

    fn on_close(&self, core: &Arc<Core>, _uuid: Uuid) {
        if core.is_running() {
            log::warn!("parent pipe lost; treating as parent crash");
            core.state_callbacks().force(core, StateEvent::OnParentCrash);
            core.stop();
        }
    }

    fn ping(&self, _core: &Arc<Core>, _uuid: Uuid) {}
}

/// Parent end of one worker's pipe: maintains the mirror and fans
/// publications out to sibling workers.
pub(crate) struct MasterPipe {
    worker_index: usize,
    decoder: Mutex<FrameDecoder>,
}

impl MasterPipe {
    pub(crate) fn new(worker_index: usize) -> MasterPipe {
        MasterPipe {
            worker_index,
            decoder: Mutex::new(FrameDecoder::new()),
        }
    }
}

impl Protocol for MasterPipe {
    fn on_data(&self, core: &Arc<Core>, uuid: Uuid) {
        let mut frames = Vec::new();
        if read_frames(core, uuid, &self.decoder, &mut frames).is_err() {
            core.force_close(uuid);
            return;
        }
        for frame in frames {
            match frame.ftype {
                FrameType::Subscribe => {
                    core.cluster()
                        .mirror
                        .lock()
                        .unwrap()
                        .subscribe(self.worker_index, frame.channel, false);
                }
                FrameType::Unsubscribe => {
                    core.cluster()
                        .mirror
                        .lock()
                        .unwrap()
                        .unsubscribe(self.worker_index, &frame.channel, false);
                }
                FrameType::PatternSubscribe => {
                    core.cluster()
                        .mirror
                        .lock()
                        .unwrap()
                        .subscribe(self.worker_index, frame.channel, true);
                }
                FrameType::PatternUnsubscribe => {
                    core.cluster()
                        .mirror
                        .lock()
                        .unwrap()
                        .unsubscribe(self.worker_index, &frame.channel, true);
                }
                FrameType::Publish => {
                    if frame.flags & FLAG_ROOT == 0 {
                        fan_out(
                            core,
                            &frame.channel,
                            &frame.msg,
                            frame.is_json,
                            Some(self.worker_index),
                        );
                    }
                    core.registry().deliver_local(
                        core,
                        frame.filter,
                        frame.channel,
                        frame.msg,
                        frame.is_json,
                    );
                }
                FrameType::Shutdown => core.stop(),
                FrameType::Ping => {}
            }
        }
    }

    fn on_shutdown(&self, _core: &Arc<Core>, _uuid: Uuid) -> Shutdown {
        Shutdown::Ignore
    }

    fn ping(&self, _core: &Arc<Core>, _uuid: Uuid) {}
}

/// Drain readable bytes into the decoder. Returns `Err` on a fatal pipe
/// error; EOF surfaces as `ConnectionClosed` from `read` and ends the
/// loop (the close path runs separately).
fn read_frames(
    core: &Arc<Core>,
    uuid: Uuid,
    decoder: &Mutex<FrameDecoder>,
    out: &mut Vec<Frame>,
) -> Result<(), Error> {
    let mut chunk = [0u8; PIPE_READ_CHUNK];
    let mut decoder = decoder.lock().unwrap();
    loop {
        match core.read(uuid, &mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => decoder.feed(&chunk[..n], out)?,
            Err(Error::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        decoder.feed(data, &mut out).unwrap();
        out
    }

    #[test]
    fn frame_round_trip() {
        let frame = Frame::publish(
            Bytes::from_static(b"news.local"),
            Bytes::from_static(b"hello"),
            true,
            false,
        );
        let mut buf = BytesMut::new();
        frame.encode(1 << 20, &mut buf).unwrap();

        let frames = decode_all(&buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ftype, FrameType::Publish);
        assert_eq!(&frames[0].channel[..], b"news.local");
        assert_eq!(&frames[0].msg[..], b"hello");
        assert!(frames[0].is_json);
    }

    #[test]
    fn oversize_message_splits_and_reassembles() {
        let payload: Vec<u8> = (0..3 * (1 << 20) + 17).map(|i| (i % 251) as u8).collect();
        let frame = Frame::publish(
            Bytes::from_static(b"bulk"),
            Bytes::from(payload.clone()),
            false,
            false,
        );
        let mut buf = BytesMut::new();
        frame.encode(1 << 20, &mut buf).unwrap();

        // More than one wire frame, one logical frame out.
        let frames = decode_all(&buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].channel[..], b"bulk");
        assert_eq!(frames[0].msg.len(), payload.len());
        assert_eq!(&frames[0].msg[..], &payload[..]);
    }

    #[test]
    fn decoder_handles_partial_feeds() {
        let frame = Frame::control(FrameType::Subscribe, Bytes::from_static(b"alerts"));
        let mut buf = BytesMut::new();
        frame.encode(1 << 20, &mut buf).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for byte in buf.iter() {
            decoder.feed(std::slice::from_ref(byte), &mut out).unwrap();
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ftype, FrameType::Subscribe);
        assert_eq!(&out[0].channel[..], b"alerts");
    }

    #[test]
    fn decoder_rejects_length_mismatch() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(10); // payload_len
        buf.put_u16_le(1); // type
        buf.put_u16_le(0); // flags
        buf.put_u16_le(3); // channel_len
        buf.put_u32_le(3); // msg_len: 3 + 3 != 10
        buf.put_i32_le(0);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_slice(b"0123456789");

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        assert!(decoder.feed(&buf, &mut out).is_err());
    }

    #[test]
    fn mirror_tracks_and_scrubs_workers() {
        let mut mirror = Mirror::new();
        mirror.subscribe(0, Bytes::from_static(b"x"), false);
        mirror.subscribe(1, Bytes::from_static(b"x"), false);
        mirror.subscribe(1, Bytes::from_static(b"news.*"), true);

        let targets = mirror.targets(b"x");
        assert!(targets.contains(&0) && targets.contains(&1));
        assert_eq!(mirror.targets(b"news.sports"), HashSet::from([1usize]));
        assert!(mirror.targets(b"nothing").is_empty());

        mirror.drop_worker(1);
        assert_eq!(mirror.targets(b"x"), HashSet::from([0usize]));
        assert!(mirror.targets(b"news.sports").is_empty());
    }

    #[test]
    fn mirror_unsubscribe_removes_empty_channels() {
        let mut mirror = Mirror::new();
        mirror.subscribe(2, Bytes::from_static(b"c"), false);
        mirror.unsubscribe(2, &Bytes::from_static(b"c"), false);
        assert!(mirror.targets(b"c").is_empty());
    }
}
