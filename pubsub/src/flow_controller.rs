use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Error;

/// What [`FlowController::acquire`] does when admitting an item would exceed a limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LimitExceededBehavior {
    /// Flow control is disabled.
    #[default]
    Ignore,
    /// Fail immediately with [`Error::FlowControlLimit`].
    Error,
    /// Wait until enough capacity is released.
    Block,
}

#[derive(Clone, Debug)]
pub struct FlowControlConfig {
    pub message_limit: usize,
    pub byte_limit: usize,
    pub limit_exceeded_behavior: LimitExceededBehavior,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            message_limit: 1000,
            byte_limit: 10_000_000,
            limit_exceeded_behavior: LimitExceededBehavior::Ignore,
        }
    }
}

/// Capacity set aside for one blocked acquirer.
struct Reservation {
    id: u64,
    bytes_needed: usize,
    bytes_reserved: usize,
    has_slot: bool,
    on_granted: Option<oneshot::Sender<()>>,
}

impl Reservation {
    fn satisfied(&self) -> bool {
        self.has_slot && self.bytes_reserved == self.bytes_needed
    }
}

#[derive(Default)]
struct State {
    outstanding_messages: usize,
    outstanding_bytes: usize,
    awaiting: VecDeque<Reservation>,
    next_id: u64,
}

/// Bounds the number and total size of items in flight.
///
/// Blocked acquirers are served strictly in arrival order. Free capacity is
/// reserved for the head of the queue first, so a large item is never starved
/// by smaller ones arriving after it. Reserved capacity is not reported as
/// outstanding until the acquirer is admitted.
pub struct FlowController {
    config: FlowControlConfig,
    state: Mutex<State>,
}

impl FlowController {
    pub fn new(config: FlowControlConfig) -> Result<Self, Error> {
        if config.limit_exceeded_behavior == LimitExceededBehavior::Block
            && (config.message_limit < 1 || config.byte_limit < 1)
        {
            return Err(Error::InvalidConfig(format!(
                "flow control limits must be at least 1: message_limit={}, byte_limit={}",
                config.message_limit, config.byte_limit
            )));
        }
        Ok(Self {
            config,
            state: Mutex::new(State::default()),
        })
    }

    pub fn config(&self) -> &FlowControlConfig {
        &self.config
    }

    /// Admits one item of `size` bytes.
    ///
    /// Dropping the returned future while it waits gives the partially
    /// reserved capacity back to the other waiters.
    pub async fn acquire(&self, size: usize) -> Result<(), Error> {
        match self.config.limit_exceeded_behavior {
            LimitExceededBehavior::Ignore => Ok(()),
            LimitExceededBehavior::Error => {
                let mut state = self.state.lock();
                if self.would_exceed(&state, size) {
                    return Err(Error::FlowControlLimit(format!(
                        "outstanding messages={}/{}, bytes={}+{}/{}",
                        state.outstanding_messages,
                        self.config.message_limit,
                        state.outstanding_bytes,
                        size,
                        self.config.byte_limit
                    )));
                }
                state.outstanding_messages += 1;
                state.outstanding_bytes += size;
                Ok(())
            }
            LimitExceededBehavior::Block => self.acquire_blocking(size).await,
        }
    }

    async fn acquire_blocking(&self, size: usize) -> Result<(), Error> {
        if size > self.config.byte_limit {
            return Err(Error::FlowControlLimit(format!(
                "item of {} bytes can never fit in byte_limit {}",
                size, self.config.byte_limit
            )));
        }

        let (id, on_granted) = {
            let mut state = self.state.lock();
            // Waiters are served before new acquirers.
            if state.awaiting.is_empty() && !self.would_exceed(&state, size) {
                state.outstanding_messages += 1;
                state.outstanding_bytes += size;
                return Ok(());
            }
            let id = state.next_id;
            state.next_id += 1;
            let (sender, receiver) = oneshot::channel();
            state.awaiting.push_back(Reservation {
                id,
                bytes_needed: size,
                bytes_reserved: 0,
                has_slot: false,
                on_granted: Some(sender),
            });
            self.distribute(&mut state);
            tracing::trace!(size, awaiting = state.awaiting.len(), "waiting for flow control capacity");
            (id, receiver)
        };

        let mut guard = ReservationGuard {
            controller: self,
            id,
            admitted: false,
        };
        let _ = on_granted.await;
        guard.admit()
    }

    /// Returns the capacity of one item of `size` bytes and wakes satisfied waiters.
    pub fn release(&self, size: usize) -> Result<(), Error> {
        if self.config.limit_exceeded_behavior == LimitExceededBehavior::Ignore {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.outstanding_messages == 0 || size > state.outstanding_bytes {
            return Err(Error::FlowControlRelease(format!(
                "release of {} bytes with outstanding messages={}, bytes={}",
                size, state.outstanding_messages, state.outstanding_bytes
            )));
        }
        state.outstanding_messages -= 1;
        state.outstanding_bytes -= size;
        self.distribute(&mut state);
        Ok(())
    }

    pub fn outstanding_messages(&self) -> usize {
        self.state.lock().outstanding_messages
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().outstanding_bytes
    }

    /// Number of acquirers currently waiting for capacity.
    pub fn awaiting(&self) -> usize {
        self.state.lock().awaiting.len()
    }

    fn would_exceed(&self, state: &State, size: usize) -> bool {
        state.outstanding_messages + 1 > self.config.message_limit
            || state.outstanding_bytes + size > self.config.byte_limit
    }

    /// Hands free capacity to waiters in FIFO order.
    fn distribute(&self, state: &mut State) {
        let reserved_slots = state.awaiting.iter().filter(|r| r.has_slot).count();
        let reserved_bytes: usize = state.awaiting.iter().map(|r| r.bytes_reserved).sum();
        let mut free_slots = self
            .config
            .message_limit
            .saturating_sub(state.outstanding_messages + reserved_slots);
        let mut free_bytes = self
            .config
            .byte_limit
            .saturating_sub(state.outstanding_bytes + reserved_bytes);

        for reservation in state.awaiting.iter_mut() {
            if free_slots == 0 && free_bytes == 0 {
                break;
            }
            if reservation.satisfied() {
                continue;
            }
            if !reservation.has_slot && free_slots > 0 {
                reservation.has_slot = true;
                free_slots -= 1;
            }
            let wanted = reservation.bytes_needed - reservation.bytes_reserved;
            let granted = wanted.min(free_bytes);
            reservation.bytes_reserved += granted;
            free_bytes -= granted;

            if reservation.satisfied() {
                if let Some(sender) = reservation.on_granted.take() {
                    let _ = sender.send(());
                }
            }
        }
    }
}

struct ReservationGuard<'a> {
    controller: &'a FlowController,
    id: u64,
    admitted: bool,
}

impl ReservationGuard<'_> {
    fn admit(&mut self) -> Result<(), Error> {
        let mut state = self.controller.state.lock();
        let position = state.awaiting.iter().position(|r| r.id == self.id);
        let reservation = match position.and_then(|i| state.awaiting.remove(i)) {
            Some(r) => r,
            None => return Err(Error::FlowControlLimit("flow control reservation lost".to_string())),
        };
        self.admitted = true;
        state.outstanding_messages += 1;
        state.outstanding_bytes += reservation.bytes_needed;
        Ok(())
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let mut state = self.controller.state.lock();
        if let Some(i) = state.awaiting.iter().position(|r| r.id == self.id) {
            state.awaiting.remove(i);
            self.controller.distribute(&mut state);
        }
    }
}
