//! Multi-stepper command synchronization.
//!
//! The mcu can only queue a limited number of step commands. This
//! module tracks when mcu move-queue slots free up and merges the
//! pending message streams of all steppers in `req_clock` order before
//! handing them to the transport, so that no stepper can starve the
//! others of space in the mcu move queue.

use crate::message::{CommandQueue, Transport};
use crate::step_compressor::{Result, StepCompressor};

pub struct StepperSync<T: Transport> {
    transport: T,
    cq: CommandQueue,
    steppers: Vec<StepCompressor>,
    // Min-heap of clocks at which mcu move-queue slots free up
    move_clocks: Vec<u64>,
}

impl<T: Transport> StepperSync<T> {
    /// `move_num` is the depth of the mcu's move queue.
    pub fn new(mut transport: T, steppers: Vec<StepCompressor>, move_num: usize) -> Self {
        let cq = transport.alloc_command_queue();
        StepperSync {
            transport,
            cq,
            steppers,
            move_clocks: vec![0; move_num],
        }
    }

    pub fn steppers(&self) -> &[StepCompressor] {
        &self.steppers
    }

    pub fn stepper(&self, idx: usize) -> &StepCompressor {
        &self.steppers[idx]
    }

    pub fn stepper_mut(&mut self, idx: usize) -> &mut StepCompressor {
        &mut self.steppers[idx]
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Propagate the print-time to mcu-clock conversion to every
    /// stepper.
    pub fn set_time(&mut self, time_offset: f64, mcu_freq: f64) {
        for sc in &mut self.steppers {
            sc.set_time(time_offset, mcu_freq);
        }
    }

    // Replace the heap root with req_clock and sift it down
    fn heap_replace(&mut self, req_clock: u64) {
        let mc = &mut self.move_clocks;
        let nmc = mc.len();
        let mut pos = 0;
        loop {
            let child1_pos = 2 * pos + 1;
            let child2_pos = 2 * pos + 2;
            let child1_clock = if child1_pos < nmc { mc[child1_pos] } else { u64::MAX };
            let child2_clock = if child2_pos < nmc { mc[child2_pos] } else { u64::MAX };
            if req_clock <= child1_clock && req_clock <= child2_clock {
                mc[pos] = req_clock;
                break;
            }
            if child1_clock < child2_clock {
                mc[pos] = child1_clock;
                pos = child1_pos;
            } else {
                mc[pos] = child2_clock;
                pos = child2_pos;
            }
        }
    }

    /// Compress every stepper up to `move_clock`, then transmit all
    /// scheduled commands in `req_clock` order.
    pub fn flush(&mut self, move_clock: u64) -> Result<()> {
        for sc in &mut self.steppers {
            sc.flush(move_clock)?;
        }

        // Order commands by the req_clock of each pending command
        let mut batch = Vec::new();
        loop {
            // Find the message with the lowest req_clock
            let mut pick: Option<(usize, u64, u64)> = None;
            for (i, sc) in self.steppers.iter().enumerate() {
                if let Some(m) = sc.msg_queue.front() {
                    let better = match pick {
                        Some((_, req_clock, _)) => m.req_clock < req_clock,
                        None => true,
                    };
                    if better {
                        pick = Some((i, m.req_clock, m.min_clock));
                    }
                }
            }
            let Some((i, req_clock, min_clock)) = pick else {
                break;
            };
            if min_clock != 0 && req_clock > move_clock {
                break;
            }

            let next_avail = self.move_clocks[0];
            if min_clock != 0 {
                // A nonzero min_clock means the command consumes an mcu
                // move-queue slot and holds the clock at which that
                // slot frees up again
                self.heap_replace(min_clock);
            }
            let mut msg = self.steppers[i]
                .msg_queue
                .pop_front()
                .expect("picked message");
            // Reset min_clock to its transmit meaning (earliest send time)
            msg.min_clock = next_avail;
            batch.push(msg);
        }

        if !batch.is_empty() {
            self.transport.send_batch(&mut self.cq, batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, RecordingTransport};

    fn stepper_with_msgs(oid: u32, msgs: &[(u64, u64)]) -> StepCompressor {
        let mut sc = StepCompressor::new(oid);
        sc.fill(25, 11, 12);
        for &(req_clock, min_clock) in msgs {
            let mut m = Message::encode(&[11, oid, 0, 1, 0]);
            m.req_clock = req_clock;
            m.min_clock = min_clock;
            sc.msg_queue.push_back(m);
        }
        sc
    }

    #[test]
    fn merges_two_steppers_in_req_clock_order() {
        let a = stepper_with_msgs(0, &[(100, 0)]);
        let b = stepper_with_msgs(1, &[(150, 120)]);
        let mut ss = StepperSync::new(RecordingTransport::default(), vec![a, b], 2);

        ss.flush(1000).unwrap();

        assert_eq!(ss.move_clocks, vec![0, 120]);
        let transport = ss.into_transport();
        let msgs: Vec<_> = transport.messages().collect();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].payload[1], 0);
        assert_eq!(msgs[1].payload[1], 1);
        // B consumed a move slot; its transmitted min_clock is the
        // pre-replace heap root
        assert_eq!(msgs[1].min_clock, 0);
    }

    #[test]
    fn ties_break_by_stepper_enumeration_order() {
        let a = stepper_with_msgs(7, &[(100, 0)]);
        let b = stepper_with_msgs(3, &[(100, 0)]);
        let mut ss = StepperSync::new(RecordingTransport::default(), vec![a, b], 4);

        ss.flush(1000).unwrap();

        let transport = ss.into_transport();
        let msgs: Vec<_> = transport.messages().collect();
        assert_eq!(msgs[0].payload[1], 7);
        assert_eq!(msgs[1].payload[1], 3);
    }

    #[test]
    fn slot_users_past_move_clock_stay_queued() {
        let a = stepper_with_msgs(0, &[(150, 120), (900, 700)]);
        let mut ss = StepperSync::new(RecordingTransport::default(), vec![a], 2);

        ss.flush(500).unwrap();

        assert_eq!(ss.stepper(0).msg_queue.len(), 1);
        assert_eq!(ss.stepper(0).msg_queue[0].req_clock, 900);
        let transport = ss.into_transport();
        assert_eq!(transport.messages().count(), 1);
    }

    #[test]
    fn non_slot_messages_ignore_move_clock() {
        let a = stepper_with_msgs(0, &[(900, 0)]);
        let mut ss = StepperSync::new(RecordingTransport::default(), vec![a], 2);

        ss.flush(500).unwrap();

        assert_eq!(ss.stepper(0).msg_queue.len(), 0);
        let transport = ss.into_transport();
        assert_eq!(transport.messages().count(), 1);
    }

    #[test]
    fn move_clocks_stay_a_min_heap() {
        let msgs: Vec<(u64, u64)> = (1..=40).map(|i| (i * 10, i * 10)).collect();
        let a = stepper_with_msgs(0, &msgs);
        let mut ss = StepperSync::new(RecordingTransport::default(), vec![a], 7);

        ss.flush(u64::MAX).unwrap();

        let mc = &ss.move_clocks;
        for pos in 0..mc.len() {
            for child in [2 * pos + 1, 2 * pos + 2] {
                if child < mc.len() {
                    assert!(mc[pos] <= mc[child], "heap violated at {pos}");
                }
            }
        }
        assert_eq!(mc[0], ss.move_clocks.iter().copied().min().unwrap());
    }

    #[test]
    fn full_pipeline_orders_commands_across_steppers() {
        let mut a = StepCompressor::new(0);
        a.fill(25, 11, 12);
        a.set_time(0.0, 1_000_000.0);
        let mut b = StepCompressor::new(1);
        b.fill(25, 11, 12);
        b.set_time(0.0, 1_000_000.0);
        let mut ss = StepperSync::new(RecordingTransport::default(), vec![a, b], 16);

        for i in 1..=20u64 {
            let t = i as f64 * 0.001;
            ss.stepper_mut(0).append(1, 0.0, t).unwrap();
            ss.stepper_mut(1).append(0, 0.0, t + 0.0003).unwrap();
        }
        ss.stepper_mut(0).commit().unwrap();
        ss.stepper_mut(1).commit().unwrap();
        ss.flush(u64::MAX).unwrap();

        assert_eq!(ss.stepper(0).last_position(), 20);
        assert_eq!(ss.stepper(1).last_position(), -20);
        let transport = ss.into_transport();
        let reqs: Vec<u64> = transport.messages().map(|m| m.req_clock).collect();
        assert!(reqs.windows(2).all(|w| w[0] <= w[1]), "req order: {reqs:?}");
        let counted: u64 = transport
            .messages()
            .filter(|m| m.payload[0] == 11)
            .map(|m| m.payload[3] as u64)
            .sum();
        assert_eq!(counted, 40);
    }
}
