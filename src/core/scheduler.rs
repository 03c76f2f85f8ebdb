//! Per-device polling scheduler
//!
//! Owns the request queue and the frame-pacing deadline for one device.
//! Exactly one request is outstanding at any time: a cycle waits out the
//! single-shot frame deadline, exchanges one register group with the
//! transport collaborator, decodes the response into the register map and
//! re-arms the deadline. The queue is regenerated from the map's
//! configuration-ordered group list whenever it runs dry, every group, read
//! and write alike; write groups are re-written from the locally
//! authoritative values on each pass.

use std::collections::VecDeque;
use std::time::Duration;

use futures::future;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::codec;
use super::events::{publish_parameter, EventSender};
use super::register_map::{PollRequest, RegisterGroup, RegisterMap};
use super::transport::RegisterTransport;

/// Scheduler state: `Idle` while disconnected, `Polling` while cycling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    #[default]
    Idle,
    Polling,
}

/// Request queue plus frame-interval gate for one device.
#[derive(Debug)]
pub struct PollScheduler {
    state: SchedulerState,
    queue: VecDeque<PollRequest>,
    frame_interval: Duration,
    /// Single-shot deadline armed after each request completes; `None` means
    /// the next cycle may fire immediately (first cycle after connect).
    deadline: Option<Instant>,
}

impl PollScheduler {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            state: SchedulerState::Idle,
            queue: VecDeque::new(),
            frame_interval,
            deadline: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_polling(&self) -> bool {
        self.state == SchedulerState::Polling
    }

    /// Enter `Polling`. Called on a successful connect notification; the
    /// first cycle fires without waiting for the frame interval.
    pub fn start(&mut self) {
        self.state = SchedulerState::Polling;
        self.deadline = None;
    }

    /// Back to `Idle`: stop the timer gate and discard in-flight state.
    pub fn stop(&mut self) {
        self.state = SchedulerState::Idle;
        self.queue.clear();
        self.deadline = None;
    }

    /// Run one scheduler cycle against the device's map and transport.
    ///
    /// Pends forever while idle or while the map has nothing to poll, so the
    /// owning worker can park this future in its select loop. Cancellation
    /// safe throughout: the current request stays at the head of the queue
    /// until its exchange completed, so a cycle dropped mid-exchange (a
    /// command arrived in the worker) reissues the same request instead of
    /// abandoning it.
    pub async fn run_cycle(
        &mut self,
        map: &mut RegisterMap,
        transport: &mut dyn RegisterTransport,
        events: &EventSender,
        device_id: &str,
    ) {
        if self.state != SchedulerState::Polling {
            future::pending::<()>().await;
        }

        if let Some(deadline) = self.deadline {
            sleep_until(deadline).await;
        }

        if self.queue.is_empty() {
            self.queue.extend(map.poll_requests());
            if self.queue.is_empty() {
                // Nothing configured for this device; wait for an external
                // trigger (there is none while the map stays empty).
                future::pending::<()>().await;
            }
        }

        // Invariant: exactly one request outstanding from here to
        // completion. Dequeued only after the exchange, so an interrupted
        // cycle picks it up again.
        let Some(request) = self.queue.front().copied() else {
            return;
        };

        if request.is_read {
            match transport
                .read_registers(request.kind, request.address, request.register_count)
                .await
            {
                Ok(words) => {
                    if let Some(group) = map.group_mut(request.address) {
                        for (key, value) in decode_into_group(group, &words) {
                            publish_parameter(events, device_id, &key, value);
                        }
                    } else {
                        warn!(
                            device = device_id,
                            address = request.address,
                            "read response for address absent from register map"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        device = device_id,
                        address = request.address,
                        kind = request.kind.as_str(),
                        "read request failed: {e}"
                    );
                },
            }
        } else {
            match map.group(request.address) {
                Some(group) => {
                    let words = pack_group(group, device_id);
                    match transport
                        .write_registers(request.kind, request.address, &words)
                        .await
                    {
                        Ok(()) => {
                            debug!(
                                device = device_id,
                                address = request.address,
                                "write request completed"
                            );
                        },
                        Err(e) => {
                            warn!(
                                device = device_id,
                                address = request.address,
                                "write request failed: {e}"
                            );
                        },
                    }
                },
                None => {
                    warn!(
                        device = device_id,
                        address = request.address,
                        "write request for address absent from register map"
                    );
                },
            }
        }

        // Re-arm the frame gate only after the exchange completed, success
        // or error; the next dequeue waits it out.
        let _ = self.queue.pop_front();
        self.deadline = Some(Instant::now() + self.frame_interval);
    }
}

/// Decode a read response into the group's member parameters.
///
/// Returns the (key, value) pairs whose stored value actually changed, in
/// member order. A single register fans out through one `extract` per
/// member; a wide response collapses into the group's single member.
pub(crate) fn decode_into_group(group: &mut RegisterGroup, words: &[u16]) -> Vec<(String, u64)> {
    if words.len() != group.register_count as usize {
        warn!(
            address = group.address,
            expected = group.register_count,
            got = words.len(),
            "read response length mismatch"
        );
        return Vec::new();
    }

    let mut changed = Vec::new();

    if group.register_count == 1 {
        let register = u64::from(words[0]);
        for member in &mut group.members {
            match codec::extract(
                register,
                16,
                u32::from(member.bit_offset),
                u32::from(member.bit_length),
            ) {
                Ok(value) => {
                    if member.value != value {
                        member.value = value;
                        changed.push((member.key.clone(), value));
                    }
                },
                Err(e) => {
                    warn!(key = %member.key, "decode failed: {e}");
                },
            }
        }
    } else if let Some(member) = group.members.first_mut() {
        let value = codec::combine_words(words);
        if member.value != value {
            member.value = value;
            changed.push((member.key.clone(), value));
        }
    }

    changed
}

/// Pack a write group's member values into outgoing register words.
///
/// Sub-word members fold into one 16-bit register through repeated `inject`;
/// a member that no longer fits its field is logged and skipped, leaving the
/// other fields intact. Wide groups split their single member's value into
/// big-endian words.
pub(crate) fn pack_group(group: &RegisterGroup, device_id: &str) -> Vec<u16> {
    if group.register_count == 1 {
        let mut register = 0u64;
        for member in &group.members {
            match codec::inject(
                register,
                16,
                u32::from(member.bit_offset),
                u32::from(member.bit_length),
                member.value,
            ) {
                Ok(updated) => register = updated,
                Err(e) => {
                    warn!(
                        device = device_id,
                        key = %member.key,
                        "pack failed, field skipped: {e}"
                    );
                },
            }
        }
        vec![register as u16]
    } else {
        let value = group.members.first().map(|m| m.value).unwrap_or(0);
        codec::split_words(value, group.register_count as usize)
    }
}
