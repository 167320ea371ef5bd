//! The six-state call model.
//!
//! Both parties track their own and their peer's state; the pair drives the
//! transitions. Replay protection comes from fresh 24-bit session numbers
//! per call: a replayed frame matches no live session and at worst creates
//! a throwaway call record that times out. A call whose both halves reach
//! CALLENDED is destroyed on the following tick, never from the dispatch
//! path that produced the transition.

use mycel_identity::Sid;
use rand_core::{OsRng, RngCore};

use crate::codecs::{self, CodecFlags};
use crate::error::VompError;
use crate::monitor::MonitorSink;
use crate::wire::{self, StateFrame};

pub const VOMP_MAX_CALLS: usize = 16;
pub const VOMP_SESSION_MASK: u32 = 0xFF_FFFF;
pub const VOMP_CALL_STATUS_INTERVAL_MS: u64 = 1_000;
pub const VOMP_CALL_DIAL_TIMEOUT_MS: u64 = 5_000;
pub const VOMP_CALL_RING_TIMEOUT_MS: u64 = 120_000;
pub const VOMP_CALL_NETWORK_TIMEOUT_MS: u64 = 120_000;
/// Copies of each audio datagram, to ride out link drops.
pub const VOMP_AUDIO_SEND_COPIES: u8 = 4;
/// Recently observed audio end-times kept for duplicate suppression.
const SEEN_AUDIO_WINDOW: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum CallState {
    NoCall = 1,
    CallPrep = 2,
    RingingOut = 3,
    RingingIn = 4,
    InCall = 5,
    CallEnded = 6,
}

impl CallState {
    pub fn from_wire(value: u8) -> Result<Self, VompError> {
        match value {
            1 => Ok(Self::NoCall),
            2 => Ok(Self::CallPrep),
            3 => Ok(Self::RingingOut),
            4 => Ok(Self::RingingIn),
            5 => Ok(Self::InCall),
            6 => Ok(Self::CallEnded),
            other => Err(VompError::Parse(format!("invalid call state {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallHalf {
    pub sid: Sid,
    pub did: String,
    pub state: CallState,
    pub session: u32,
    pub sequence: u16,
}

impl CallHalf {
    fn new(sid: Sid, session: u32) -> Self {
        Self { sid, did: String::new(), state: CallState::NoCall, session, sequence: 0 }
    }
}

/// A datagram for the peer, to be wrapped into an MDP frame on the VoMP
/// port by the caller.
#[derive(Clone, Debug)]
pub struct VompOut {
    pub dst: Sid,
    pub payload: Vec<u8>,
    pub send_copies: u8,
}

pub struct Call {
    pub local: CallHalf,
    pub remote: CallHalf,
    pub initiated_call: bool,
    pub create_time: u64,
    pub last_activity: u64,
    /// Milliseconds of audio sent so far.
    pub audio_clock: u32,
    pub last_sent_status: Option<u8>,
    pub remote_codec_flags: CodecFlags,
    seen_samples: [u32; SEEN_AUDIO_WINDOW],
    sample_pos: usize,
}

impl Call {
    fn new(local_sid: Sid, remote_sid: Sid, local_session: u32, remote_session: u32, now: u64) -> Self {
        Self {
            local: CallHalf::new(local_sid, local_session),
            remote: CallHalf::new(remote_sid, remote_session),
            initiated_call: false,
            create_time: now,
            last_activity: now,
            audio_clock: 0,
            last_sent_status: None,
            remote_codec_flags: CodecFlags::new(),
            seen_samples: [0; SEEN_AUDIO_WINDOW],
            sample_pos: 0,
        }
    }

    /// Check and record an audio end-time. Small and imperfect; clients
    /// still reorder and filter for themselves.
    pub fn audio_already_seen(&mut self, end_time: u32) -> bool {
        if self.seen_samples.contains(&end_time) {
            return true;
        }
        self.seen_samples[self.sample_pos] = end_time;
        self.sample_pos = (self.sample_pos + 1) % SEEN_AUDIO_WINDOW;
        false
    }

    fn combined_status(&self) -> u8 {
        ((self.remote.state as u8) << 4) | self.local.state as u8
    }
}

pub struct CallTable {
    calls: Vec<Call>,
    my_codecs: CodecFlags,
    monitor: Box<dyn MonitorSink>,
}

impl CallTable {
    pub fn new(my_codecs: CodecFlags, monitor: Box<dyn MonitorSink>) -> Self {
        Self { calls: Vec::new(), my_codecs, monitor }
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn call_by_session(&self, session: u32) -> Option<&Call> {
        self.calls.iter().find(|call| call.local.session == session)
    }

    fn index_by_session(&self, session: u32) -> Option<usize> {
        self.calls.iter().position(|call| call.local.session == session)
    }

    fn generate_session(&self) -> u32 {
        loop {
            let session = OsRng.next_u32() & VOMP_SESSION_MASK;
            if session == 0 {
                continue;
            }
            if self
                .calls
                .iter()
                .any(|call| call.local.session == session || call.remote.session == session)
            {
                continue;
            }
            return session;
        }
    }

    /// Start an outgoing call. Returns the session token the client will
    /// use for the rest of the call, plus the first frame for the peer.
    pub fn dial(
        &mut self,
        local_sid: Sid,
        remote_sid: Sid,
        local_did: &str,
        remote_did: &str,
        now: u64,
    ) -> Result<(u32, Vec<VompOut>), VompError> {
        if self.calls.len() >= VOMP_MAX_CALLS {
            return Err(VompError::TooManyCalls(VOMP_MAX_CALLS));
        }
        let session = self.generate_session();
        let mut call = Call::new(local_sid, remote_sid, session, 0, now);
        call.local.did = local_did.to_string();
        call.remote.did = remote_did.to_string();
        call.initiated_call = true;
        self.calls.push(call);
        let idx = self.calls.len() - 1;

        Self::update_local_state(
            &mut self.calls[idx],
            self.monitor.as_mut(),
            &self.my_codecs,
            CallState::CallPrep,
        );
        let mut out = Vec::new();
        self.update(idx, now, &mut out);
        Ok((session, out))
    }

    /// The client's phone is now audibly ringing. Idempotent: the state
    /// machine may already have advanced to RINGINGIN on its own.
    pub fn ringing(&mut self, session: u32, now: u64) -> Result<Vec<VompOut>, VompError> {
        let idx = self.index_by_session(session).ok_or(VompError::NoSuchCall)?;
        {
            let call = &self.calls[idx];
            if call.initiated_call
                || call.local.state > CallState::RingingIn
                || call.remote.state != CallState::RingingOut
            {
                return Err(VompError::WrongState);
            }
        }
        Self::update_local_state(
            &mut self.calls[idx],
            self.monitor.as_mut(),
            &self.my_codecs,
            CallState::RingingIn,
        );
        let mut out = Vec::new();
        self.update(idx, now, &mut out);
        Ok(out)
    }

    pub fn pickup(&mut self, session: u32, now: u64) -> Result<Vec<VompOut>, VompError> {
        let idx = self.index_by_session(session).ok_or(VompError::NoSuchCall)?;
        {
            let call = &self.calls[idx];
            if call.local.state > CallState::RingingIn
                || call.remote.state != CallState::RingingOut
            {
                return Err(VompError::WrongState);
            }
        }
        Self::update_local_state(
            &mut self.calls[idx],
            self.monitor.as_mut(),
            &self.my_codecs,
            CallState::InCall,
        );
        // the audio clock runs from when the call is established
        self.calls[idx].create_time = now;
        let mut out = Vec::new();
        self.update(idx, now, &mut out);
        Ok(out)
    }

    pub fn hangup(&mut self, session: u32, now: u64) -> Result<Vec<VompOut>, VompError> {
        let idx = self.index_by_session(session).ok_or(VompError::NoSuchCall)?;
        Self::update_local_state(
            &mut self.calls[idx],
            self.monitor.as_mut(),
            &self.my_codecs,
            CallState::CallEnded,
        );
        let mut out = Vec::new();
        self.update(idx, now, &mut out);
        Ok(out)
    }

    /// Packetise locally captured audio for the peer.
    pub fn send_audio(
        &mut self,
        session: u32,
        codec: u8,
        audio: &[u8],
        now: u64,
    ) -> Result<Vec<VompOut>, VompError> {
        let idx = self.index_by_session(session).ok_or(VompError::NoSuchCall)?;
        if self.calls[idx].local.state != CallState::InCall {
            return Err(VompError::WrongState);
        }
        let block = codecs::sample_size(codec)
            .filter(|&size| size > 0)
            .ok_or_else(|| VompError::Parse(format!("codec 0x{codec:02x} carries no audio")))?;
        let duration = codecs::timespan_ms(codec).unwrap_or(20);

        let mut out = Vec::new();
        let mut offset = 0;
        while offset < audio.len() {
            let end = (offset + block).min(audio.len());
            let call = &mut self.calls[idx];
            let tail = wire::encode_audio(call.audio_clock, codec, &audio[offset..end]);
            let frame = Self::state_frame(call, now, tail);
            call.audio_clock = call.audio_clock.wrapping_add(duration);
            call.local.sequence = call.local.sequence.wrapping_add(1);
            out.push(VompOut {
                dst: call.remote.sid,
                payload: frame.encode(),
                send_copies: VOMP_AUDIO_SEND_COPIES,
            });
            offset = end;
        }
        Ok(out)
    }

    /// Process a frame received on the VoMP port.
    pub fn received(
        &mut self,
        src: Sid,
        dst: Sid,
        payload: &[u8],
        now: u64,
    ) -> Result<Vec<VompOut>, VompError> {
        let frame = StateFrame::decode(payload)?;
        let sender_state = CallState::from_wire(frame.sender_state())?;
        let claimed_state = CallState::from_wire(frame.claimed_recipient_state()).ok();

        let idx = match self.find_or_create(
            src,
            dst,
            frame.sender_session,
            frame.recipient_session,
            sender_state,
            claimed_state,
            now,
        ) {
            Some(idx) => idx,
            None => return Err(VompError::NotACallOpening),
        };

        let mut recvr_state = self.calls[idx].local.state;
        self.calls[idx].remote.sequence = frame.sender_sequence;

        // mutual dial: an incoming call from a party we are currently
        // dialling. Resolved in favour of the non-initiator accepting; the
        // numerically lower SID abandons its own attempt so exactly one
        // leg survives.
        let mut abandoned = None;
        if sender_state == CallState::CallPrep && !self.calls[idx].initiated_call && dst < src {
            abandoned = self.calls.iter().position(|call| {
                call.initiated_call
                    && call.remote.sid == src
                    && call.local.sid == dst
                    && call.local.state < CallState::InCall
            });
        }

        if !self.monitor.active() {
            // nobody local could ever answer, so reject outright
            log::info!("vomp: rejecting call, no listening clients");
            recvr_state = CallState::CallEnded;
        }

        if recvr_state < CallState::RingingOut && sender_state < CallState::RingingOut {
            let precall = wire::decode_precall(&frame.tail);
            {
                let call = &mut self.calls[idx];
                for codec in precall.codecs.iter() {
                    call.remote_codec_flags.set(codec);
                }
                if !call.initiated_call {
                    if let Some((remote_did, local_did)) = precall.dids {
                        call.remote.did = remote_did;
                        call.local.did = local_did;
                    }
                }
            }
            if !self.my_codecs.intersects(&self.calls[idx].remote_codec_flags) {
                log::info!("vomp: rejecting call, no matching codecs found");
                recvr_state = CallState::CallEnded;
            }
        }

        if sender_state == CallState::CallEnded {
            // the far end gave up; follow it down no matter where we were
            recvr_state = CallState::CallEnded;
        }

        use CallState::*;
        let mut process_audio = false;
        match (recvr_state, sender_state) {
            (NoCall, CallPrep) => {}
            (NoCall, RingingOut) | (RingingIn, RingingOut) => {
                if self.calls[idx].initiated_call {
                    // mutual dial resolved in favour of the non-initiator
                    recvr_state = CallEnded;
                } else if recvr_state == NoCall {
                    recvr_state = RingingIn;
                }
            }
            (CallPrep, NoCall) | (CallPrep, CallPrep) => {
                if self.calls[idx].initiated_call {
                    recvr_state = RingingOut;
                } else {
                    recvr_state = CallEnded;
                }
            }
            (RingingOut, NoCall) | (RingingOut, CallPrep) => {}
            (RingingOut, RingingIn) => {}
            (RingingIn, InCall) => {
                recvr_state = InCall;
                self.calls[idx].create_time = now;
                process_audio = true;
            }
            (RingingOut, RingingOut) => {
                // mutual dial; skip straight to the call
                recvr_state = InCall;
                self.calls[idx].create_time = now;
            }
            (InCall, RingingOut) => {}
            (RingingOut, InCall) => {
                recvr_state = InCall;
                self.calls[idx].create_time = now;
                process_audio = true;
            }
            (InCall, InCall) => {
                process_audio = true;
            }
            (CallEnded, _) => {
                // we hung up; wait for the far end to acknowledge
            }
            _ => {
                log::warn!(
                    "vomp: ignoring invalid call state {:?}.{:?}",
                    sender_state,
                    recvr_state
                );
                return Ok(Vec::new());
            }
        }

        if process_audio {
            self.process_audio(idx, &frame);
        }

        Self::update_remote_state(&mut self.calls[idx], self.monitor.as_mut(), sender_state);
        Self::update_local_state(
            &mut self.calls[idx],
            self.monitor.as_mut(),
            &self.my_codecs,
            recvr_state,
        );
        self.calls[idx].last_activity = now;

        let mut out = Vec::new();
        self.update(idx, now, &mut out);
        if let Some(other) = abandoned {
            if other != idx {
                Self::update_local_state(
                    &mut self.calls[other],
                    self.monitor.as_mut(),
                    &self.my_codecs,
                    CallState::CallEnded,
                );
                self.update(other, now, &mut out);
            }
        }
        Ok(out)
    }

    /// Per-interval pass: expire overdue calls, keep live ones fresh, and
    /// reap calls both sides have ended.
    pub fn tick(&mut self, now: u64) -> Vec<VompOut> {
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < self.calls.len() {
            let expired = {
                let call = &self.calls[idx];
                (call.remote.state < CallState::RingingOut
                    && call.create_time + VOMP_CALL_DIAL_TIMEOUT_MS < now)
                    || (call.local.state < CallState::InCall
                        && call.create_time + VOMP_CALL_RING_TIMEOUT_MS < now)
                    || call.last_activity + VOMP_CALL_NETWORK_TIMEOUT_MS < now
            };
            if expired {
                Self::update_local_state(
                    &mut self.calls[idx],
                    self.monitor.as_mut(),
                    &self.my_codecs,
                    CallState::CallEnded,
                );
                Self::update_remote_state(
                    &mut self.calls[idx],
                    self.monitor.as_mut(),
                    CallState::CallEnded,
                );
                self.update(idx, now, &mut out);
            }

            if self.calls[idx].local.state == CallState::CallEnded
                && self.calls[idx].remote.state == CallState::CallEnded
            {
                let call = self.calls.swap_remove(idx);
                log::debug!(
                    "vomp: destroyed call {:06x}:{:06x}",
                    call.local.session,
                    call.remote.session
                );
                continue;
            }

            self.update(idx, now, &mut out);
            // a liveness frame even when nothing changed
            out.push(Self::send_status_remote(
                &mut self.calls[idx],
                &self.my_codecs,
                now,
            ));
            self.monitor.line(&format!(
                "\nKEEPALIVE:{:06x}\n",
                self.calls[idx].local.session
            ));
            idx += 1;
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn find_or_create(
        &mut self,
        remote_sid: Sid,
        local_sid: Sid,
        sender_session: u32,
        recvr_session: u32,
        sender_state: CallState,
        claimed_state: Option<CallState>,
        now: u64,
    ) -> Option<usize> {
        for (idx, call) in self.calls.iter_mut().enumerate() {
            let mut checked = 0;
            if call.remote.session != 0 && sender_session != 0 {
                checked += 1;
                if sender_session != call.remote.session {
                    continue;
                }
            }
            if call.local.session != 0 && recvr_session != 0 {
                checked += 1;
                if recvr_session != call.local.session {
                    continue;
                }
            }
            if checked == 0 {
                continue;
            }
            if remote_sid != call.remote.sid || local_sid != call.local.sid {
                continue;
            }
            if call.remote.session == 0 {
                call.remote.session = sender_session;
            }
            return Some(idx);
        }

        // never open a record for a dead or mid-call session: that is the
        // replay protection
        if sender_state == CallState::CallEnded || claimed_state == Some(CallState::CallEnded) {
            return None;
        }
        if sender_state != CallState::CallPrep && claimed_state != Some(CallState::CallPrep) {
            return None;
        }
        if self.calls.len() >= VOMP_MAX_CALLS {
            log::warn!("vomp: all {VOMP_MAX_CALLS} call slots in use");
            return None;
        }
        let local_session = self.generate_session();
        self.calls
            .push(Call::new(local_sid, remote_sid, local_session, sender_session, now));
        Some(self.calls.len() - 1)
    }

    fn process_audio(&mut self, idx: usize, frame: &StateFrame) {
        let Ok(chunk) = wire::decode_audio(&frame.tail) else {
            return;
        };
        if chunk.codec == 0 || codecs::sample_size(chunk.codec).is_none() {
            return;
        }
        let start = chunk.audio_clock;
        let end = start + codecs::timespan_ms(chunk.codec).unwrap_or(1) - 1;
        let sequence = self.calls[idx].remote.sequence;
        let session = self.calls[idx].local.session;
        if !self.calls[idx].audio_already_seen(end) {
            let header = format!(
                "\n*{}:AUDIOPACKET:{:x}:{}:{}:{}:{}\n",
                chunk.samples.len(),
                session,
                chunk.codec,
                start,
                end,
                sequence
            );
            self.monitor.audio(&header, chunk.samples);
        }
    }

    /// Build the current state frame for the peer and advance our sequence.
    fn send_status_remote(call: &mut Call, my_codecs: &CodecFlags, now: u64) -> VompOut {
        let tail = if call.local.state < CallState::RingingOut
            && call.remote.state < CallState::RingingOut
        {
            let dids = call
                .initiated_call
                .then(|| (call.local.did.as_str(), call.remote.did.as_str()));
            wire::encode_precall(my_codecs, dids)
        } else {
            Vec::new()
        };
        let frame = Self::state_frame(call, now, tail);
        call.local.sequence = call.local.sequence.wrapping_add(1);
        VompOut { dst: call.remote.sid, payload: frame.encode(), send_copies: 1 }
    }

    fn state_frame(call: &Call, now: u64, tail: Vec<u8>) -> StateFrame {
        StateFrame {
            states: call.combined_status(),
            recipient_sequence: call.remote.sequence,
            sender_sequence: call.local.sequence,
            call_millis: now.saturating_sub(call.create_time) as u16,
            recipient_session: call.remote.session,
            sender_session: call.local.session,
            tail,
        }
    }

    /// Send a status frame and tell monitor clients, but only when the
    /// combined state differs from what was last sent.
    fn update(&mut self, idx: usize, now: u64, out: &mut Vec<VompOut>) {
        let combined = self.calls[idx].combined_status();
        if self.calls[idx].last_sent_status == Some(combined) {
            return;
        }
        self.calls[idx].last_sent_status = Some(combined);
        out.push(Self::send_status_remote(
            &mut self.calls[idx],
            &self.my_codecs,
            now,
        ));
        let call = &self.calls[idx];
        self.monitor.line(&format!(
            "\nCALLSTATUS:{:06x}:{:06x}:{}:{}:0:{}:{}:{}:{}\n",
            call.local.session,
            call.remote.session,
            call.local.state as u8,
            call.remote.state as u8,
            call.local.sid,
            call.remote.sid,
            call.local.did,
            call.remote.did
        ));
    }

    fn update_local_state(
        call: &mut Call,
        monitor: &mut dyn MonitorSink,
        my_codecs: &CodecFlags,
        new_state: CallState,
    ) {
        if call.local.state >= new_state {
            return;
        }
        if new_state > CallState::CallPrep
            && new_state <= CallState::InCall
            && call.local.state <= CallState::CallPrep
        {
            let mut line = format!("\nCODECS:{:06x}", call.local.session);
            for codec in my_codecs.common(&call.remote_codec_flags) {
                line.push_str(&format!(":{codec}"));
            }
            line.push('\n');
            monitor.line(&line);
        }
        match new_state {
            CallState::CallPrep => {
                monitor.line(&format!(
                    "\nCALLTO:{:06x}:{}:{}:{}:{}\n",
                    call.local.session,
                    call.local.sid,
                    call.local.did,
                    call.remote.sid,
                    call.remote.did
                ));
            }
            CallState::CallEnded => {
                monitor.line(&format!("\nHANGUP:{:06x}\n", call.local.session));
            }
            _ => {}
        }
        call.local.state = new_state;
    }

    fn update_remote_state(call: &mut Call, monitor: &mut dyn MonitorSink, new_state: CallState) {
        if call.remote.state >= new_state {
            return;
        }
        match new_state {
            CallState::RingingOut => {
                monitor.line(&format!(
                    "\nCALLFROM:{:06x}:{}:{}:{}:{}\n",
                    call.local.session,
                    call.local.sid,
                    call.local.did,
                    call.remote.sid,
                    call.remote.did
                ));
            }
            CallState::RingingIn => {
                monitor.line(&format!("\nRINGING:{:06x}\n", call.local.session));
            }
            CallState::InCall => {
                if call.remote.state == CallState::RingingIn {
                    monitor.line(&format!("\nANSWERED:{:06x}\n", call.local.session));
                }
            }
            _ => {}
        }
        call.remote.state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::{CODEC_GSM_FULL, CODEC_PCM};
    use crate::monitor::RecordingMonitor;
    use mycel_identity::Keypair;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A recording monitor the test can still inspect after handing the
    /// table its boxed half.
    #[derive(Clone, Default)]
    struct SharedMonitor(Rc<RefCell<RecordingMonitor>>);

    impl MonitorSink for SharedMonitor {
        fn active(&self) -> bool {
            true
        }
        fn line(&mut self, line: &str) {
            self.0.borrow_mut().lines.push(line.to_string());
        }
        fn audio(&mut self, _header: &str, samples: &[u8]) {
            self.0.borrow_mut().audio_packets.push(samples.to_vec());
        }
    }

    fn table() -> (CallTable, SharedMonitor) {
        let monitor = SharedMonitor::default();
        let table = CallTable::new(
            CodecFlags::of(&[CODEC_PCM, CODEC_GSM_FULL]),
            Box::new(monitor.clone()),
        );
        (table, monitor)
    }

    fn sid() -> Sid {
        Keypair::generate(OsRng).sid()
    }

    /// Deliver every frame in `frames` to `to`, gathering replies.
    fn deliver(
        to: &mut CallTable,
        to_sid: Sid,
        from_sid: Sid,
        frames: Vec<VompOut>,
        now: u64,
    ) -> Vec<VompOut> {
        let mut replies = Vec::new();
        for frame in frames {
            assert_eq!(frame.dst, to_sid);
            match to.received(from_sid, to_sid, &frame.payload, now) {
                Ok(mut out) => replies.append(&mut out),
                Err(VompError::NotACallOpening) => {}
                Err(err) => panic!("delivery failed: {err}"),
            }
        }
        replies
    }

    #[test]
    fn full_call_setup_answer_and_audio() {
        let (alice_sid, bob_sid) = (sid(), sid());
        let (mut alice, alice_monitor) = table();
        let (mut bob, bob_monitor) = table();

        let (session, frames) = alice.dial(alice_sid, bob_sid, "5551", "5552", 0).expect("dial");
        assert_eq!(alice.call_by_session(session).expect("call").local.state, CallState::CallPrep);

        // CALLPREP reaches bob, who issues a session and answers with NOCALL
        let to_alice = deliver(&mut bob, bob_sid, alice_sid, frames, 10);
        assert_eq!(bob.call_count(), 1);

        // alice sees (CALLPREP, NOCALL) and rings out
        let to_bob = deliver(&mut alice, alice_sid, bob_sid, to_alice, 20);
        assert_eq!(
            alice.call_by_session(session).expect("call").local.state,
            CallState::RingingOut
        );

        // alice's ring-out reaches bob, whose phone starts ringing
        let to_alice = deliver(&mut bob, bob_sid, alice_sid, to_bob, 30);
        let bob_session = {
            let call = bob.calls.first().expect("call");
            assert_eq!(call.remote.state, CallState::RingingOut);
            assert_eq!(call.local.state, CallState::RingingIn);
            assert_eq!(call.remote.did, "5551");
            assert_eq!(call.local.did, "5552");
            call.local.session
        };
        // alice hears the ring
        let _ = deliver(&mut alice, alice_sid, bob_sid, to_alice, 40);
        assert!(alice_monitor.0.borrow().lines.iter().any(|line| line.contains("RINGING")));

        // bob picks up; both sides converge on INCALL
        let to_alice = bob.pickup(bob_session, 60).expect("pickup");
        let to_bob = deliver(&mut alice, alice_sid, bob_sid, to_alice, 70);
        assert_eq!(alice.call_by_session(session).expect("call").local.state, CallState::InCall);
        let _ = deliver(&mut bob, bob_sid, alice_sid, to_bob, 80);
        assert_eq!(
            bob.call_by_session(bob_session).expect("call").local.state,
            CallState::InCall
        );

        // audio flows, and the duplicate copies are suppressed at bob's end
        let audio = alice.send_audio(session, CODEC_PCM, &[0x11; 640], 100).expect("audio");
        assert_eq!(audio.len(), 2);
        assert!(audio.iter().all(|frame| frame.send_copies == VOMP_AUDIO_SEND_COPIES));
        let mut duplicated = audio.clone();
        duplicated.extend(audio.clone());
        let _ = deliver(&mut bob, bob_sid, alice_sid, duplicated, 110);
        assert_eq!(bob_monitor.0.borrow().audio_packets.len(), 2);
    }

    #[test]
    fn dial_collision_resolves_in_favour_of_the_non_initiator() {
        let (a, b) = (sid(), sid());
        let (low_sid, high_sid) = if a < b { (a, b) } else { (b, a) };
        let (mut low, _) = table();
        let (mut high, _) = table();

        let (_, low_frames) = low.dial(low_sid, high_sid, "1000", "2000", 0).expect("dial");
        let (_, high_frames) = high.dial(high_sid, low_sid, "2000", "1000", 0).expect("dial");

        // each CALLPREP opens a second, non-initiated record at the other
        // end; drive exchanges to a fixed point
        let mut to_low = deliver(&mut high, high_sid, low_sid, low_frames, 10);
        let mut to_high = deliver(&mut low, low_sid, high_sid, high_frames, 10);
        for round in 0..10u64 {
            let now = 20 + round * 10;
            let next_to_high = deliver(&mut low, low_sid, high_sid, to_low, now);
            let next_to_low = deliver(&mut high, high_sid, low_sid, to_high, now);
            to_high = next_to_high;
            to_low = next_to_low;
            if to_high.is_empty() && to_low.is_empty() {
                break;
            }
        }

        // the lower side abandoned its own attempt and is ringing for the
        // peer's; the higher side's initiated leg survives, ringing out
        let low_live: Vec<&Call> =
            low.calls.iter().filter(|call| call.local.state != CallState::CallEnded).collect();
        assert_eq!(low_live.len(), 1, "low side keeps one live call");
        assert!(!low_live[0].initiated_call);
        assert_eq!(low_live[0].local.state, CallState::RingingIn);
        let session = low_live[0].local.session;

        let high_live: Vec<&Call> =
            high.calls.iter().filter(|call| call.local.state != CallState::CallEnded).collect();
        assert_eq!(high_live.len(), 1, "high side keeps one live call");
        assert!(high_live[0].initiated_call);
        assert_eq!(high_live[0].local.state, CallState::RingingOut);
        let high_session = high_live[0].local.session;

        // the non-initiator answers; both converge on INCALL and nobody
        // lingers in RINGINGOUT
        let to_high = low.pickup(session, 200).expect("pickup");
        let to_low = deliver(&mut high, high_sid, low_sid, to_high, 210);
        let _ = deliver(&mut low, low_sid, high_sid, to_low, 220);

        assert_eq!(
            low.call_by_session(session).expect("call").local.state,
            CallState::InCall
        );
        assert_eq!(
            high.call_by_session(high_session).expect("call").local.state,
            CallState::InCall
        );
        for call in low.calls.iter().chain(high.calls.iter()) {
            assert_ne!(call.local.state, CallState::RingingOut);
        }
    }

    #[test]
    fn last_sent_status_tracks_combined_state() {
        let (alice_sid, bob_sid) = (sid(), sid());
        let (mut alice, _) = table();
        let (session, _) = alice.dial(alice_sid, bob_sid, "1", "2", 0).expect("dial");
        let call = alice.call_by_session(session).expect("call");
        assert_eq!(
            call.last_sent_status,
            Some(((call.remote.state as u8) << 4) | call.local.state as u8)
        );
    }

    #[test]
    fn seen_audio_ring_suppresses_within_window() {
        let mut call = Call::new(sid(), sid(), 1, 2, 0);
        assert!(!call.audio_already_seen(100));
        assert!(call.audio_already_seen(100));
        // push the window forward far enough to forget 100
        for end_time in 0..SEEN_AUDIO_WINDOW as u32 {
            call.audio_already_seen(1_000 + end_time);
        }
        assert!(!call.audio_already_seen(100));
    }

    #[test]
    fn no_codec_overlap_ends_the_call() {
        let (alice_sid, bob_sid) = (sid(), sid());
        let (mut alice, _) = table();
        let mut bob = CallTable::new(
            CodecFlags::of(&[crate::codecs::CODEC_CODEC2_1400]),
            Box::new(SharedMonitor::default()),
        );
        let (_, frames) = alice.dial(alice_sid, bob_sid, "1", "2", 0).expect("dial");
        let _ = deliver(&mut bob, bob_sid, alice_sid, frames, 10);
        assert!(bob
            .calls
            .iter()
            .all(|call| call.local.state == CallState::CallEnded));
    }

    #[test]
    fn replayed_session_of_ended_call_opens_nothing() {
        let (alice_sid, bob_sid) = (sid(), sid());
        let (mut bob, _) = table();
        let replay = StateFrame {
            states: (CallState::InCall as u8) << 4 | CallState::InCall as u8,
            recipient_sequence: 7,
            sender_sequence: 9,
            call_millis: 0,
            recipient_session: 0x111111,
            sender_session: 0x222222,
            tail: Vec::new(),
        };
        assert!(matches!(
            bob.received(alice_sid, bob_sid, &replay.encode(), 5),
            Err(VompError::NotACallOpening)
        ));
        assert_eq!(bob.call_count(), 0);
    }

    #[test]
    fn timeouts_force_call_teardown_and_reaping() {
        let (alice_sid, bob_sid) = (sid(), sid());
        let (mut alice, _) = table();
        let (session, _) = alice.dial(alice_sid, bob_sid, "1", "2", 0).expect("dial");

        // no answer within the dial timeout
        let _ = alice.tick(VOMP_CALL_DIAL_TIMEOUT_MS + 1_001);
        assert!(alice.call_by_session(session).is_none());
        assert_eq!(alice.call_count(), 0);
    }

    #[test]
    fn rejects_calls_when_no_monitor_listens() {
        let (alice_sid, bob_sid) = (sid(), sid());
        let (mut alice, _) = table();
        let mut bob = CallTable::new(
            CodecFlags::of(&[CODEC_PCM]),
            Box::new(crate::monitor::LogMonitor { accept_calls: false }),
        );
        let (_, frames) = alice.dial(alice_sid, bob_sid, "1", "2", 0).expect("dial");
        let _ = deliver(&mut bob, bob_sid, alice_sid, frames, 10);
        assert!(bob.calls.iter().all(|call| call.local.state == CallState::CallEnded));
    }
}
