/* RDM discovery engine.
 *
 * Enumerates the responders on a bus by binary search over the 48-bit UID
 * space: broadcast unmute, then repeatedly DUB a range, splitting it on
 * collisions and muting each responder as it is isolated. The engine only
 * talks to the bus through the DiscoveryTarget trait, so the widget layer
 * and the test responders plug in the same way. */

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::uid::{Uid, UidSet};

/* Give up on a range after this many decode failures. */
pub const MAX_BRANCH_FAILURES: u8 = 5;

/* Give up on a range after this many DUBs that discovered nothing. */
pub const MAX_EMPTY_BRANCH_ATTEMPTS: u8 = 3;

/* Per-UID mute retries before the responder is marked bad. */
pub const MAX_MUTE_ATTEMPTS: u8 = 3;

/* Broadcast unmute is fire-and-forget, so repeat it. */
pub const BROADCAST_UNMUTE_REPEATS: u8 = 3;

/* DUB reply framing. */
const PREAMBLE: u8 = 0xfe;
const PREAMBLE_SEPARATOR: u8 = 0xaa;
/* Up to 7 preamble bytes plus the separator. */
const PREAMBLE_SIZE: usize = 8;
const EUID_SIZE: usize = 12;
const DUB_CHECKSUM_SIZE: usize = 4;

/// What the discovery engine needs from the transport below it.
///
/// Implemented by the widget port layer; mute results reflect whether a
/// valid DISC_MUTE acknowledgement was decoded.
#[async_trait]
pub trait DiscoveryTarget: Send {
    /// Broadcast a DISC_UN_MUTE to every device.
    async fn unmute_all(&mut self);

    /// Mute a single device. Returns true if the device acknowledged.
    async fn mute_device(&mut self, target: Uid) -> bool;

    /// Send a DUB covering the inclusive range and return the raw reply
    /// bytes. An empty reply means nothing responded.
    async fn branch(&mut self, lower: Uid, upper: Uid) -> Vec<u8>;
}

/// Cancels an in-progress discovery run.
///
/// Aborting clears the engine's range stack; the run completes with
/// `(success = false, empty set)` and any in-flight target operation is
/// abandoned.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    fn reset(&self) {
        self.tx.send_replace(false);
    }

    async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            /* We hold the sender through the Arc, so this cannot fail. */
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/* A node in the range arena. Children subdivide the parent without
 * overlap; fault state bubbles to the parent on pop. */
struct UidRange {
    lower: Uid,
    upper: Uid,
    parent: Option<usize>,
    attempt: u8,
    failures: u8,
    uids_discovered: u32,
    branch_corrupt: bool,
}

/* The range stack, arena-backed: the stack holds arena indices and
 * parents are index links, so the whole tree drops at once. */
struct RangeStack {
    arena: Vec<UidRange>,
    stack: Vec<usize>,
    tree_corrupt: bool,
}

impl RangeStack {
    fn new(lower: Uid, upper: Uid) -> Self {
        let mut ranges = Self {
            arena: Vec::new(),
            stack: Vec::new(),
            tree_corrupt: false,
        };
        ranges.push(lower, upper, None);
        ranges
    }

    fn push(&mut self, lower: Uid, upper: Uid, parent: Option<usize>) {
        debug_assert!(lower <= upper);
        let index = self.arena.len();
        self.arena.push(UidRange {
            lower,
            upper,
            parent,
            attempt: 0,
            failures: 0,
            uids_discovered: 0,
            branch_corrupt: false,
        });
        self.stack.push(index);
    }

    fn top(&self) -> Option<usize> {
        self.stack.last().copied()
    }

    fn range(&mut self, index: usize) -> &mut UidRange {
        &mut self.arena[index]
    }

    fn bounds(&self, index: usize) -> (Uid, Uid) {
        (self.arena[index].lower, self.arena[index].upper)
    }

    /* Pop the current range, folding its count into the parent. A corrupt
     * root corrupts the whole tree. */
    fn pop(&mut self) {
        let index = self.stack.pop().expect("pop on empty range stack");
        let (parent, discovered, corrupt) = {
            let range = &self.arena[index];
            (range.parent, range.uids_discovered, range.branch_corrupt)
        };
        match parent {
            None => {
                if corrupt {
                    info!("discovery tree is corrupted");
                    self.tree_corrupt = true;
                }
            }
            Some(parent) => self.arena[parent].uids_discovered += discovered,
        }
    }

    /* Pop after hitting a failure limit: the parent inherits the fault. */
    fn pop_corrupt(&mut self) {
        if let Some(index) = self.top() {
            if let Some(parent) = self.arena[index].parent {
                self.arena[parent].branch_corrupt = true;
            }
        }
        self.pop();
    }
}

/// The discovery engine.
///
/// The discovered set persists on the agent between runs so that
/// incremental discovery can re-mute known responders before branching.
pub struct DiscoveryAgent<T> {
    target: T,
    uids: UidSet,
    abort: AbortHandle,
}

impl<T: DiscoveryTarget> DiscoveryAgent<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            uids: UidSet::new(),
            abort: AbortHandle::new(),
        }
    }

    /// The UIDs known from previous runs.
    pub fn uids(&self) -> &UidSet {
        &self.uids
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// A handle that can abort the in-progress run from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Unmute the bus, forget everything and enumerate from scratch.
    pub async fn run_full(&mut self) -> (bool, UidSet) {
        self.run(false).await
    }

    /// Re-mute the previously discovered responders, then enumerate. A
    /// re-muted device stays silent during the branch phase and does not
    /// slow the search down.
    pub async fn run_incremental(&mut self) -> (bool, UidSet) {
        self.run(true).await
    }

    async fn run(&mut self, incremental: bool) -> (bool, UidSet) {
        self.abort.reset();
        let abort = self.abort.clone();

        let to_mute: Vec<Uid> = if incremental {
            self.uids.iter().copied().collect()
        } else {
            self.uids.clear();
            Vec::new()
        };

        info!(
            incremental,
            known = self.uids.len(),
            "starting discovery"
        );

        for _ in 0..BROADCAST_UNMUTE_REPEATS {
            if abortable(&abort, self.target.unmute_all()).await.is_none() {
                return (false, UidSet::new());
            }
        }

        /* Incremental only: one mute attempt per known responder; the ones
         * that have gone away are dropped from the set. */
        for uid in to_mute {
            debug!(%uid, "muting previously discovered responder");
            match abortable(&abort, self.target.mute_device(uid)).await {
                None => return (false, UidSet::new()),
                Some(true) => debug!(%uid, "muted"),
                Some(false) => {
                    warn!(%uid, "unable to mute, device has gone");
                    self.uids.remove(&uid);
                }
            }
        }

        let mut ranges = RangeStack::new(Uid::new(0, 0), Uid::all_devices());
        let mut bad_uids = UidSet::new();
        let mut split_uids = UidSet::new();

        loop {
            let Some(top) = ranges.top() else {
                break;
            };

            {
                let range = ranges.range(top);
                if range.uids_discovered == 0 {
                    range.attempt += 1;
                }
                if range.failures == MAX_BRANCH_FAILURES
                    || range.attempt == MAX_EMPTY_BRANCH_ATTEMPTS
                    || range.branch_corrupt
                {
                    debug!(
                        lower = %range.lower,
                        upper = %range.upper,
                        "hit failure limit for branch"
                    );
                    ranges.pop_corrupt();
                    continue;
                }
            }

            let (lower, upper) = ranges.bounds(top);
            debug!(%lower, %upper, "sending DUB");
            let Some(data) = abortable(&abort, self.target.branch(lower, upper)).await else {
                return (false, UidSet::new());
            };

            if data.is_empty() {
                /* Timeout: nothing left unmuted in this range. */
                ranges.pop();
                continue;
            }

            let Some(uid) = decode_dub_response(&data) else {
                handle_collision(&mut ranges);
                continue;
            };

            if self.uids.contains(&uid) {
                warn!(%uid, "previously muted responder continues to respond");
                ranges.range(top).failures += 1;
                if split_uids.insert(uid) {
                    split_around(&mut ranges, uid);
                } else {
                    handle_collision(&mut ranges);
                }
                continue;
            }

            if bad_uids.contains(&uid) {
                info!(%uid, "previously bad responder continues to respond");
                ranges.range(top).failures += 1;
                if split_uids.insert(uid) {
                    split_around(&mut ranges, uid);
                } else {
                    handle_collision(&mut ranges);
                }
                continue;
            }

            /* A new responder: mute it, retrying a bounded number of
             * times. Phantom UIDs never acknowledge and end up bad. */
            let mut attempts = 0;
            loop {
                info!(%uid, "muting");
                let Some(muted) = abortable(&abort, self.target.mute_device(uid)).await else {
                    return (false, UidSet::new());
                };
                attempts += 1;
                if muted {
                    self.uids.insert(uid);
                    ranges.range(top).uids_discovered += 1;
                    break;
                }
                if attempts >= MAX_MUTE_ATTEMPTS {
                    info!(%uid, "no response to mute, marking as bad");
                    bad_uids.insert(uid);
                    break;
                }
            }
        }

        let success = !ranges.tree_corrupt;
        info!(success, found = self.uids.len(), "discovery complete");
        (success, self.uids.clone())
    }
}

/* Run a target operation, bailing out when the abort flag trips. The
 * abandoned operation's future is dropped, so late completions are
 * no-ops by construction. */
async fn abortable<F: std::future::Future>(abort: &AbortHandle, op: F) -> Option<F::Output> {
    tokio::select! {
        result = op => Some(result),
        _ = abort.aborted() => None,
    }
}

/* A garbled DUB reply: more than one responder answered. Split the range
 * in half and search both sides. The lower half is pushed last so it is
 * processed first. */
fn handle_collision(ranges: &mut RangeStack) {
    let top = ranges.top().expect("collision with empty range stack");
    let (lower, upper) = ranges.bounds(top);

    if lower == upper {
        warn!(uid = %lower, "end of tree reached");
        ranges.range(top).failures += 1;
        return;
    }

    let mid = (lower.to_u64() + upper.to_u64()) / 2;
    debug!(
        %lower,
        mid = %Uid::from(mid),
        %upper,
        "collision, splitting"
    );
    ranges.range(top).uids_discovered = 0;
    ranges.push(Uid::from(mid + 1), upper, Some(top));
    ranges.push(lower, Uid::from(mid), Some(top));
}

/* A responder that should be silent keeps answering. Skip its UID and
 * search either side of it. */
fn split_around(ranges: &mut RangeStack, bad: Uid) {
    let top = ranges.top().expect("split with empty range stack");
    let (lower, upper) = ranges.bounds(top);

    if lower == upper {
        warn!(uid = %lower, "end of tree reached");
        ranges.range(top).failures += 1;
        return;
    }

    if bad < lower || bad > upper {
        info!(%bad, %lower, %upper, "UID not within range, assuming a phantom");
        handle_collision(ranges);
        return;
    }

    debug!(%bad, "splitting either side of bad UID");
    ranges.range(top).uids_discovered = 0;
    if bad != upper {
        ranges.push(Uid::from(bad.to_u64() + 1), upper, Some(top));
    }
    if bad != lower {
        ranges.push(lower, Uid::from(bad.to_u64() - 1), Some(top));
    }
}

/// Decode a DUB reply: 0-7 bytes of 0xfe preamble, the 0xaa separator,
/// the 12-byte interleaved EUID and the 4-byte interleaved checksum.
///
/// Returns `None` for anything that does not decode cleanly, which the
/// engine treats as a collision.
pub fn decode_dub_response(data: &[u8]) -> Option<Uid> {
    if data.len() < 1 + EUID_SIZE + DUB_CHECKSUM_SIZE {
        return None;
    }

    let mut offset = 0;
    while offset < PREAMBLE_SIZE - 1 && data[offset] != PREAMBLE_SEPARATOR {
        if data[offset] != PREAMBLE {
            return None;
        }
        offset += 1;
    }
    if data[offset] != PREAMBLE_SEPARATOR {
        return None;
    }
    offset += 1;

    /* A clean reply is exactly the EUID plus the checksum; extra or
     * missing bytes mean the responses collided on the wire. */
    if data.len() - offset != EUID_SIZE + DUB_CHECKSUM_SIZE {
        return None;
    }

    let euid = &data[offset..offset + EUID_SIZE];
    let cs = &data[offset + EUID_SIZE..offset + EUID_SIZE + DUB_CHECKSUM_SIZE];

    /* The checksum covers the EUID bytes as seen on the wire. */
    let mut calculated: u16 = 0;
    for byte in euid {
        calculated = calculated.wrapping_add(u16::from(*byte));
    }
    let recovered = u16::from_be_bytes([cs[0] & cs[1], cs[2] & cs[3]]);
    if recovered != calculated {
        debug!(recovered, calculated, "DUB checksum mismatch");
        return None;
    }

    let manufacturer_id = u16::from_be_bytes([euid[0] & euid[1], euid[2] & euid[3]]);
    let device_id = u32::from_be_bytes([
        euid[4] & euid[5],
        euid[6] & euid[7],
        euid[8] & euid[9],
        euid[10] & euid[11],
    ]);
    Some(Uid::new(manufacturer_id, device_id))
}

/// Encode the DUB reply a responder with `uid` would send, preamble
/// included. Used by responder-side code and the discovery tests.
pub fn encode_dub_response(uid: Uid) -> Vec<u8> {
    let mut data = vec![0u8; PREAMBLE_SIZE + EUID_SIZE + DUB_CHECKSUM_SIZE];
    or_dub_response(uid, &mut data);
    data
}

/* OR a responder's reply into a shared buffer, the way simultaneous
 * transmitters combine on an EIA-485 bus. */
fn or_dub_response(uid: Uid, data: &mut [u8]) {
    for byte in data.iter_mut().take(PREAMBLE_SIZE - 1) {
        *byte |= PREAMBLE;
    }
    data[PREAMBLE_SIZE - 1] |= PREAMBLE_SEPARATOR;

    let manufacturer_id = uid.manufacturer_id();
    let device_id = uid.device_id();
    let mut checksum: u16 = 0;
    let mut or_byte = |data: &mut [u8], index: usize, value: u8, checksum: &mut u16| {
        data[index] |= value;
        *checksum = checksum.wrapping_add(u16::from(value));
    };

    or_byte(data, 8, ((manufacturer_id >> 8) as u8) | 0xaa, &mut checksum);
    or_byte(data, 9, ((manufacturer_id >> 8) as u8) | 0x55, &mut checksum);
    or_byte(data, 10, (manufacturer_id as u8) | 0xaa, &mut checksum);
    or_byte(data, 11, (manufacturer_id as u8) | 0x55, &mut checksum);

    or_byte(data, 12, ((device_id >> 24) as u8) | 0xaa, &mut checksum);
    or_byte(data, 13, ((device_id >> 24) as u8) | 0x55, &mut checksum);
    or_byte(data, 14, ((device_id >> 16) as u8) | 0xaa, &mut checksum);
    or_byte(data, 15, ((device_id >> 16) as u8) | 0x55, &mut checksum);
    or_byte(data, 16, ((device_id >> 8) as u8) | 0xaa, &mut checksum);
    or_byte(data, 17, ((device_id >> 8) as u8) | 0x55, &mut checksum);
    or_byte(data, 18, (device_id as u8) | 0xaa, &mut checksum);
    or_byte(data, 19, (device_id as u8) | 0x55, &mut checksum);

    data[20] |= ((checksum >> 8) as u8) | 0xaa;
    data[21] |= ((checksum >> 8) as u8) | 0x55;
    data[22] |= (checksum as u8) | 0xaa;
    data[23] |= (checksum as u8) | 0x55;
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOVERY_RESPONSE_SIZE: usize = PREAMBLE_SIZE + EUID_SIZE + DUB_CHECKSUM_SIZE;

    /* The responder behaviors exercised against the engine. The default
     * implementations model a well-behaved device. */
    trait Responder: Send {
        fn uid(&self) -> Uid;
        fn muted(&self) -> bool;
        fn set_muted(&mut self, muted: bool);

        fn unmute(&mut self) {
            self.set_muted(false);
        }

        fn mute(&mut self, uid: Uid) -> bool {
            if self.uid() == uid {
                self.set_muted(true);
                return true;
            }
            false
        }

        fn should_respond(&self, lower: Uid, upper: Uid) -> bool {
            self.uid() >= lower && self.uid() <= upper && !self.muted()
        }

        fn form_response(&self, lower: Uid, upper: Uid, data: &mut [u8], used: &mut usize) -> bool {
            if !self.should_respond(lower, upper) {
                return false;
            }
            or_dub_response(self.uid(), data);
            *used = DISCOVERY_RESPONSE_SIZE;
            true
        }

        fn reset(&mut self) {}
    }

    struct WellBehaved {
        uid: Uid,
        is_muted: bool,
    }

    impl WellBehaved {
        fn new(uid: Uid) -> Self {
            Self {
                uid,
                is_muted: false,
            }
        }
    }

    impl Responder for WellBehaved {
        fn uid(&self) -> Uid {
            self.uid
        }
        fn muted(&self) -> bool {
            self.is_muted
        }
        fn set_muted(&mut self, muted: bool) {
            self.is_muted = muted;
        }
    }

    /* Keeps responding after being muted. */
    struct Obnoxious(WellBehaved);

    impl Responder for Obnoxious {
        fn uid(&self) -> Uid {
            self.0.uid
        }
        fn muted(&self) -> bool {
            self.0.is_muted
        }
        fn set_muted(&mut self, muted: bool) {
            self.0.is_muted = muted;
        }
        fn should_respond(&self, lower: Uid, upper: Uid) -> bool {
            self.uid() >= lower && self.uid() <= upper
        }
    }

    /* Replies with a trailing byte of garbage. */
    struct Rambling(WellBehaved);

    impl Responder for Rambling {
        fn uid(&self) -> Uid {
            self.0.uid
        }
        fn muted(&self) -> bool {
            self.0.is_muted
        }
        fn set_muted(&mut self, muted: bool) {
            self.0.is_muted = muted;
        }
        fn form_response(&self, lower: Uid, upper: Uid, data: &mut [u8], used: &mut usize) -> bool {
            if !self.should_respond(lower, upper) {
                return false;
            }
            or_dub_response(self.uid(), data);
            data[DISCOVERY_RESPONSE_SIZE] = 0x52;
            *used = DISCOVERY_RESPONSE_SIZE + 1;
            true
        }
    }

    /* Replies with one byte too few. */
    struct Brief(WellBehaved);

    impl Responder for Brief {
        fn uid(&self) -> Uid {
            self.0.uid
        }
        fn muted(&self) -> bool {
            self.0.is_muted
        }
        fn set_muted(&mut self, muted: bool) {
            self.0.is_muted = muted;
        }
        fn form_response(&self, lower: Uid, upper: Uid, data: &mut [u8], used: &mut usize) -> bool {
            if !self.should_respond(lower, upper) {
                return false;
            }
            or_dub_response(self.uid(), data);
            *used = DISCOVERY_RESPONSE_SIZE - 1;
            true
        }
    }

    /* Goes silent once the range narrows to a single manufacturer,
     * simulating broken UID inequality handling. */
    struct BiPolar(WellBehaved);

    impl Responder for BiPolar {
        fn uid(&self) -> Uid {
            self.0.uid
        }
        fn muted(&self) -> bool {
            self.0.is_muted
        }
        fn set_muted(&mut self, muted: bool) {
            self.0.is_muted = muted;
        }
        fn should_respond(&self, lower: Uid, upper: Uid) -> bool {
            if self.uid() < lower || self.uid() > upper || self.muted() {
                return false;
            }
            !(self.uid().manufacturer_id() == lower.manufacturer_id()
                && self.uid().manufacturer_id() == upper.manufacturer_id())
        }
    }

    /* Never acknowledges a mute. */
    struct NonMuting(WellBehaved);

    impl Responder for NonMuting {
        fn uid(&self) -> Uid {
            self.0.uid
        }
        fn muted(&self) -> bool {
            self.0.is_muted
        }
        fn set_muted(&mut self, muted: bool) {
            self.0.is_muted = muted;
        }
        fn mute(&mut self, _uid: Uid) -> bool {
            false
        }
    }

    /* Acknowledges a mute only after `threshold` failed attempts. */
    struct FlakeyMuting {
        inner: WellBehaved,
        threshold: u32,
        attempts: u32,
    }

    impl FlakeyMuting {
        fn new(uid: Uid) -> Self {
            Self {
                inner: WellBehaved::new(uid),
                threshold: 2,
                attempts: 0,
            }
        }
    }

    impl Responder for FlakeyMuting {
        fn uid(&self) -> Uid {
            self.inner.uid
        }
        fn muted(&self) -> bool {
            self.inner.is_muted
        }
        fn set_muted(&mut self, muted: bool) {
            self.inner.is_muted = muted;
        }
        fn mute(&mut self, uid: Uid) -> bool {
            if self.uid() != uid {
                return false;
            }
            self.attempts += 1;
            if self.attempts > self.threshold {
                self.inner.is_muted = true;
                return true;
            }
            false
        }
        fn reset(&mut self) {
            self.attempts = 0;
        }
    }

    /* Fronts a set of devices that only appear once the proxy itself is
     * muted, and only one at a time. */
    struct Proxy {
        inner: WellBehaved,
        proxied: Vec<Box<dyn Responder>>,
    }

    impl Proxy {
        fn new(uid: Uid, proxied: Vec<Box<dyn Responder>>) -> Self {
            Self {
                inner: WellBehaved::new(uid),
                proxied,
            }
        }
    }

    impl Responder for Proxy {
        fn uid(&self) -> Uid {
            self.inner.uid
        }
        fn muted(&self) -> bool {
            self.inner.is_muted
        }
        fn set_muted(&mut self, muted: bool) {
            self.inner.is_muted = muted;
        }
        fn unmute(&mut self) {
            self.inner.is_muted = false;
            for responder in &mut self.proxied {
                responder.unmute();
            }
        }
        fn mute(&mut self, uid: Uid) -> bool {
            let mut muted = if self.uid() == uid {
                self.inner.is_muted = true;
                true
            } else {
                false
            };
            if self.inner.is_muted {
                for responder in &mut self.proxied {
                    muted |= responder.mute(uid);
                }
            }
            muted
        }
        fn form_response(&self, lower: Uid, upper: Uid, data: &mut [u8], used: &mut usize) -> bool {
            let mut responded = if self.should_respond(lower, upper) {
                or_dub_response(self.uid(), data);
                *used = DISCOVERY_RESPONSE_SIZE;
                true
            } else {
                false
            };
            if self.inner.is_muted {
                for responder in &self.proxied {
                    if responded {
                        break;
                    }
                    responded |= responder.form_response(lower, upper, data, used);
                }
            }
            responded
        }
    }

    /* The fake bus: responders OR their replies into a shared buffer. */
    struct MockBus {
        responders: Vec<Box<dyn Responder>>,
        unmute_calls: u32,
    }

    impl MockBus {
        fn new(responders: Vec<Box<dyn Responder>>) -> Self {
            Self {
                responders,
                unmute_calls: 0,
            }
        }

        fn add(&mut self, responder: Box<dyn Responder>) {
            self.responders.push(responder);
        }

        fn remove(&mut self, uid: Uid) {
            self.responders.retain(|r| r.uid() != uid);
        }

        fn reset_responders(&mut self) {
            for responder in &mut self.responders {
                responder.reset();
            }
        }
    }

    #[async_trait]
    impl DiscoveryTarget for MockBus {
        async fn unmute_all(&mut self) {
            for responder in &mut self.responders {
                responder.unmute();
            }
            self.unmute_calls += 1;
        }

        async fn mute_device(&mut self, target: Uid) -> bool {
            for responder in &mut self.responders {
                if responder.mute(target) {
                    return true;
                }
            }
            false
        }

        async fn branch(&mut self, lower: Uid, upper: Uid) -> Vec<u8> {
            let mut data = vec![0u8; 2 * DISCOVERY_RESPONSE_SIZE];
            let mut actual = 0usize;
            let mut valid = false;
            for responder in &self.responders {
                let mut used = data.len();
                if responder.form_response(lower, upper, &mut data, &mut used) {
                    actual = actual.max(used);
                    valid = true;
                }
            }
            if valid {
                data.truncate(actual);
                data
            } else {
                Vec::new()
            }
        }
    }

    fn well_behaved(uids: &UidSet) -> Vec<Box<dyn Responder>> {
        uids.iter()
            .map(|uid| Box::new(WellBehaved::new(*uid)) as Box<dyn Responder>)
            .collect()
    }

    fn uid_set(uids: &[Uid]) -> UidSet {
        uids.iter().copied().collect()
    }

    #[test]
    fn dub_response_round_trip() {
        let uid = Uid::new(0x7a70, 0x12345678);
        let encoded = encode_dub_response(uid);
        assert_eq!(encoded.len(), DISCOVERY_RESPONSE_SIZE);
        assert_eq!(decode_dub_response(&encoded), Some(uid));
    }

    #[test]
    fn dub_response_rejects_damage() {
        let uid = Uid::new(0x7a70, 0x12345678);
        let encoded = encode_dub_response(uid);

        /* Too short, too long, bad preamble, bad checksum. */
        assert_eq!(decode_dub_response(&encoded[..16]), None);
        let mut long = encoded.clone();
        long.push(0x52);
        assert_eq!(decode_dub_response(&long), None);

        let mut bad_preamble = encoded.clone();
        bad_preamble[0] = 0x00;
        assert_eq!(decode_dub_response(&bad_preamble), None);

        let mut bad_checksum = encoded.clone();
        bad_checksum[20] = 0xff;
        bad_checksum[21] = 0xff;
        assert_eq!(decode_dub_response(&bad_checksum), None);
    }

    #[test]
    fn dub_response_short_preamble() {
        /* Devices may send fewer than 7 preamble bytes. */
        let uid = Uid::new(0x0102, 0x03040506);
        let full = encode_dub_response(uid);
        let short = full[5..].to_vec();
        assert_eq!(short[0], PREAMBLE);
        assert_eq!(decode_dub_response(&short), Some(uid));
    }

    #[tokio::test]
    async fn no_responders() {
        let expected = UidSet::new();
        let mut agent = DiscoveryAgent::new(MockBus::new(Vec::new()));

        let (success, uids) = agent.run_full().await;
        assert!(success);
        assert_eq!(uids, expected);
        assert_eq!(agent.target().unmute_calls, u32::from(BROADCAST_UNMUTE_REPEATS));

        let (success, uids) = agent.run_incremental().await;
        assert!(success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn single_responder() {
        let expected = uid_set(&[Uid::new(0x7a70, 0x00002001)]);
        let mut agent = DiscoveryAgent::new(MockBus::new(well_behaved(&expected)));

        let (success, uids) = agent.run_full().await;
        assert!(success);
        assert_eq!(uids, expected);

        let (success, uids) = agent.run_incremental().await;
        assert!(success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn multiple_responders_and_incremental_churn() {
        let uid_to_remove = Uid::new(0x7a70, 0x00002001);
        let mut expected = uid_set(&[
            uid_to_remove,
            Uid::new(0x7a70, 0x00002002),
            Uid::new(0x7a77, 0x00002002),
        ]);
        let mut agent = DiscoveryAgent::new(MockBus::new(well_behaved(&expected)));

        let (success, uids) = agent.run_full().await;
        assert!(success);
        assert_eq!(uids, expected);

        /* One responder leaves, a new one arrives. */
        let uid_to_add = Uid::new(0x8080, 0x00103456);
        expected.remove(&uid_to_remove);
        expected.insert(uid_to_add);
        agent.target_mut().remove(uid_to_remove);
        agent.target_mut().add(Box::new(WellBehaved::new(uid_to_add)));

        let (success, uids) = agent.run_incremental().await;
        assert!(success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn obnoxious_responders_fail_but_are_reported() {
        let obnoxious = Uid::new(0x7a77, 0x00002002);
        let obnoxious2 = Uid::new(0x7a77, 0x00003030);
        let well = Uid::new(0x7a70, 0x00002002);
        let expected = uid_set(&[well, obnoxious, obnoxious2]);

        let mut responders = well_behaved(&uid_set(&[well]));
        responders.push(Box::new(Obnoxious(WellBehaved::new(obnoxious))));
        responders.push(Box::new(Obnoxious(WellBehaved::new(obnoxious2))));
        let mut agent = DiscoveryAgent::new(MockBus::new(responders));

        let (success, uids) = agent.run_full().await;
        assert!(!success);
        assert_eq!(uids, expected);

        let (success, uids) = agent.run_incremental().await;
        assert!(!success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn rambling_responder_fails_discovery() {
        let well = Uid::new(0x7a70, 0x00002002);
        let expected = uid_set(&[well]);

        let mut responders = well_behaved(&expected);
        responders.push(Box::new(Rambling(WellBehaved::new(Uid::new(
            0x7a77, 0x00002002,
        )))));
        let mut agent = DiscoveryAgent::new(MockBus::new(responders));

        let (success, uids) = agent.run_full().await;
        assert!(!success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn brief_responder_fails_discovery() {
        let well = Uid::new(0x7a70, 0x00002002);
        let expected = uid_set(&[well]);

        let mut responders = well_behaved(&expected);
        responders.push(Box::new(Brief(WellBehaved::new(Uid::new(
            0x7a77, 0x00002002,
        )))));
        let mut agent = DiscoveryAgent::new(MockBus::new(responders));

        let (success, uids) = agent.run_full().await;
        assert!(!success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn bipolar_responders_fail_discovery() {
        let well = Uid::new(0x7a70, 0x00002002);
        let expected = uid_set(&[well]);

        let mut responders = well_behaved(&expected);
        responders.push(Box::new(BiPolar(WellBehaved::new(Uid::new(
            0x7a77, 0x00002002,
        )))));
        responders.push(Box::new(BiPolar(WellBehaved::new(Uid::new(
            0x7a77, 0x00003030,
        )))));
        let mut agent = DiscoveryAgent::new(MockBus::new(responders));

        let (success, uids) = agent.run_full().await;
        assert!(!success);
        assert_eq!(uids, expected);

        let (success, uids) = agent.run_incremental().await;
        assert!(!success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn non_muting_responders_fail_discovery() {
        let well = Uid::new(0x7a70, 0x00002002);
        let expected = uid_set(&[well]);

        let mut responders = well_behaved(&expected);
        responders.push(Box::new(NonMuting(WellBehaved::new(Uid::new(
            0x7a77, 0x00002002,
        )))));
        responders.push(Box::new(NonMuting(WellBehaved::new(Uid::new(
            0x7a77, 0x00003030,
        )))));
        let mut agent = DiscoveryAgent::new(MockBus::new(responders));

        let (success, uids) = agent.run_full().await;
        assert!(!success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn flakey_muting_within_retry_limit() {
        let well = Uid::new(0x7a70, 0x00002002);
        let flakey = Uid::new(0x7a77, 0x00002002);
        let flakey2 = Uid::new(0x7a77, 0x00003030);
        let expected = uid_set(&[well, flakey, flakey2]);

        let mut responders = well_behaved(&uid_set(&[well]));
        responders.push(Box::new(FlakeyMuting::new(flakey)));
        responders.push(Box::new(FlakeyMuting::new(flakey2)));
        let mut agent = DiscoveryAgent::new(MockBus::new(responders));

        let (success, uids) = agent.run_full().await;
        assert!(success);
        assert_eq!(uids, expected);

        agent.target_mut().reset_responders();
        let (success, uids) = agent.run_incremental().await;
        assert!(success);
        assert_eq!(uids, expected);
    }

    #[tokio::test]
    async fn proxied_responders_are_found() {
        let proxied = [
            Uid::new(0x7a70, 0x00002002),
            Uid::new(0x8080, 0x00001234),
            Uid::new(0x9000, 0x00005678),
            Uid::new(0x1020, 0x00005678),
        ];
        let proxy_uid = Uid::new(0x1010, 0x00002002);
        let direct = Uid::new(0x0001, 0x00000001);
        let direct2 = Uid::new(0x0001, 0x10000001);

        let mut expected = uid_set(&proxied);
        expected.insert(proxy_uid);
        expected.insert(direct);
        expected.insert(direct2);

        let proxied_responders = well_behaved(&uid_set(&proxied));
        let mut responders: Vec<Box<dyn Responder>> =
            vec![Box::new(Proxy::new(proxy_uid, proxied_responders))];
        responders.push(Box::new(WellBehaved::new(direct)));
        responders.push(Box::new(WellBehaved::new(direct2)));
        let mut agent = DiscoveryAgent::new(MockBus::new(responders));

        let (success, uids) = agent.run_full().await;
        assert!(success);
        assert_eq!(uids, expected);
    }

    /* A target that never answers the first branch, to park a run. */
    struct StallingTarget {
        started: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl DiscoveryTarget for StallingTarget {
        async fn unmute_all(&mut self) {}

        async fn mute_device(&mut self, _target: Uid) -> bool {
            false
        }

        async fn branch(&mut self, _lower: Uid, _upper: Uid) -> Vec<u8> {
            self.started.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn abort_terminates_a_run() {
        let started = Arc::new(tokio::sync::Notify::new());
        let mut agent = DiscoveryAgent::new(StallingTarget {
            started: Arc::clone(&started),
        });
        let abort = agent.abort_handle();

        let run = tokio::spawn(async move { agent.run_full().await });
        started.notified().await;
        abort.abort();

        let (success, uids) = run.await.expect("discovery task panicked");
        assert!(!success);
        assert!(uids.is_empty());
    }
}
