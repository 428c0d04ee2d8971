//! Per-stepper pulse schedule compression.
//!
//! Queues absolute step event times, compresses them with the
//! least-squares search into mcu `queue_step` commands, and tracks the
//! emitted history so past positions can be recovered by clock. A
//! small step-dir-step filter suppresses direction flips the mcu could
//! not honor reliably.

use std::collections::VecDeque;
use thiserror::Error;

use crate::compress::{COMPRESS_WINDOW, QueueRef, StepMove, wrap_compress};
use crate::message::{Message, TransportError};

pub(crate) const CLOCK_DIFF_MAX: u64 = 3 << 28;
const QUEUE_START_SIZE: usize = 1024;
const VERIFY_WINDOW: usize = 65535;
const SDS_FILTER_TIME: f64 = 0.000_750;
const HISTORY_EXPIRE: f64 = 30.0;

#[derive(Debug, Error)]
pub enum StepCompressError {
    #[error("stepcompress o={oid} i={interval} c={count} a={add}: invalid sequence")]
    InvalidSequence {
        oid: u32,
        interval: u32,
        count: u16,
        add: i16,
    },
    #[error(
        "stepcompress o={oid} i={interval} c={count} a={add}: point {index}: {value} not in {min}:{max}"
    )]
    PointOutOfRange {
        oid: u32,
        index: u16,
        value: i64,
        min: i64,
        max: i64,
        interval: u32,
        count: u16,
        add: i16,
    },
    #[error("stepcompress o={oid} i={interval} c={count} a={add}: point {index}: interval overflow")]
    IntervalOverflow {
        oid: u32,
        index: u16,
        interval: u32,
        count: u16,
        add: i16,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, StepCompressError>;

/// History of one emitted `queue_step`, exposed to the planner side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullHistoryStep {
    pub first_clock: u64,
    pub last_clock: u64,
    pub start_position: i64,
    pub step_count: i32,
    pub interval: i32,
    pub add: i32,
}

#[derive(Clone, Debug)]
struct HistoryEntry {
    first_clock: u64,
    last_clock: u64,
    start_position: i64,
    step_count: i32,
    interval: i32,
    add: i32,
}

pub struct StepCompressor {
    // Queue of pending absolute step clocks (low 32 bits)
    queue: Vec<u32>,
    queue_pos: usize,
    queue_next: usize,
    // Internal tracking
    max_error: u32,
    mcu_time_offset: f64,
    mcu_freq: f64,
    last_step_print_time: f64,
    last_interval: u32,
    last_ideal_step_clock: u64,
    // Message generation
    last_step_clock: u64,
    pub(crate) msg_queue: VecDeque<Message>,
    oid: u32,
    queue_step_msgtag: i32,
    set_next_step_dir_msgtag: i32,
    sdir: i32,
    invert_sdir: bool,
    // Step+dir+step filter
    next_step_clock: Option<u64>,
    next_step_dir: i32,
    // History tracking
    last_position: i64,
    history: VecDeque<HistoryEntry>,
}

impl StepCompressor {
    /// Create an empty compressor; the step direction starts unknown.
    pub fn new(oid: u32) -> Self {
        StepCompressor {
            queue: Vec::new(),
            queue_pos: 0,
            queue_next: 0,
            max_error: 0,
            mcu_time_offset: 0.0,
            mcu_freq: 1.0,
            last_step_print_time: -0.5,
            last_interval: 0,
            last_ideal_step_clock: 0,
            last_step_clock: 0,
            msg_queue: VecDeque::new(),
            oid,
            queue_step_msgtag: 0,
            set_next_step_dir_msgtag: 0,
            sdir: -1,
            invert_sdir: false,
            next_step_clock: None,
            next_step_dir: 0,
            last_position: 0,
            history: VecDeque::new(),
        }
    }

    /// Bind the tolerance and the wire tags of the two mcu commands.
    pub fn fill(&mut self, max_error: u32, queue_step_msgtag: i32, set_next_step_dir_msgtag: i32) {
        self.max_error = max_error;
        self.queue_step_msgtag = queue_step_msgtag;
        self.set_next_step_dir_msgtag = set_next_step_dir_msgtag;
    }

    /// Flip the logical-to-physical direction mapping.
    pub fn set_invert_sdir(&mut self, invert_sdir: bool) {
        if invert_sdir != self.invert_sdir {
            self.invert_sdir = invert_sdir;
            if self.sdir >= 0 {
                self.sdir ^= 1;
            }
        }
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    /// Direction of the most recently appended step.
    pub fn next_step_dir(&self) -> i32 {
        self.next_step_dir
    }

    pub fn last_position(&self) -> i64 {
        self.last_position
    }

    pub fn last_step_clock(&self) -> u64 {
        self.last_step_clock
    }

    /// Set the conversion rate of print time to mcu clock.
    pub fn set_time(&mut self, time_offset: f64, mcu_freq: f64) {
        self.mcu_time_offset = time_offset;
        self.mcu_freq = mcu_freq;
        self.calc_last_step_print_time();
    }

    // Determine the print time of last_step_clock; ages out history
    fn calc_last_step_print_time(&mut self) {
        let lsc = self.last_step_clock as f64;
        self.last_step_print_time = self.mcu_time_offset + (lsc - 0.5) / self.mcu_freq;

        if lsc > self.mcu_freq * HISTORY_EXPIRE {
            self.free_history((lsc - self.mcu_freq * HISTORY_EXPIRE) as u64);
        }
    }

    fn free_history(&mut self, end_clock: u64) {
        while let Some(last) = self.history.back() {
            if last.last_clock > end_clock {
                break;
            }
            self.history.pop_back();
        }
    }

    // Verify that a step_move matches the queued step times
    fn check_line(&self, mv: &StepMove) -> Result<()> {
        if cfg!(feature = "unchecked") {
            return Ok(());
        }
        if mv.count == 0
            || (mv.interval == 0 && mv.add == 0 && mv.count > 1)
            || mv.interval >= 0x8000_0000
        {
            return Err(StepCompressError::InvalidSequence {
                oid: self.oid,
                interval: mv.interval,
                count: mv.count,
                add: mv.add,
            });
        }
        let qr = QueueRef::new(
            &self.queue[self.queue_pos..self.queue_next],
            VERIFY_WINDOW,
            self.max_error,
            self.last_step_clock,
            self.last_ideal_step_clock,
            self.last_interval,
        );
        let mut interval = mv.interval;
        let mut p: u32 = 0;
        for i in 0..mv.count {
            let point = qr.minmax_point(i as usize);
            p = p.wrapping_add(interval);
            if (p as i64) < point.minp as i64 || (p as i64) > point.maxp as i64 {
                return Err(StepCompressError::PointOutOfRange {
                    oid: self.oid,
                    index: i + 1,
                    value: p as i64,
                    min: point.minp as i64,
                    max: point.maxp as i64,
                    interval: mv.interval,
                    count: mv.count,
                    add: mv.add,
                });
            }
            if interval >= 0x8000_0000 {
                return Err(StepCompressError::IntervalOverflow {
                    oid: self.oid,
                    index: i + 1,
                    interval: mv.interval,
                    count: mv.count,
                    add: mv.add,
                });
            }
            interval = interval.wrapping_add(mv.add as u32);
        }
        Ok(())
    }

    // Queue a queue_step command and record it in the history
    fn add_move(&mut self, first_clock: u64, mv: &StepMove) {
        let count = mv.count as i32;
        let addfactor = count * (count - 1) / 2;
        let ticks = ((mv.add as i32).wrapping_mul(addfactor) as u32)
            .wrapping_add(mv.interval.wrapping_mul(count as u32 - 1));
        let last_clock = first_clock.wrapping_add(ticks as u64);
        self.last_interval = mv
            .interval
            .wrapping_add((mv.add as i32).wrapping_mul(count - 1) as u32);

        let data = [
            self.queue_step_msgtag as u32,
            self.oid,
            mv.interval,
            mv.count as u32,
            mv.add as u32,
        ];
        let mut msg = Message::encode(&data);
        msg.min_clock = self.last_step_clock;
        msg.req_clock = self.last_step_clock;
        if mv.count == 1 && first_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            msg.req_clock = first_clock;
        }
        self.msg_queue.push_back(msg);
        self.last_step_clock = last_clock;

        let step_count = if self.sdir != 0 { count } else { -count };
        let entry = HistoryEntry {
            first_clock,
            last_clock,
            start_position: self.last_position,
            step_count,
            interval: mv.interval as i32,
            add: mv.add as i32,
        };
        self.last_position += step_count as i64;
        self.history.push_front(entry);
    }

    // Convert pending step clocks into queue_step commands
    fn queue_flush(&mut self, move_clock: u64) -> Result<()> {
        if self.queue_pos >= self.queue_next {
            return Ok(());
        }
        while self.last_step_clock < move_clock {
            let qr = QueueRef::new(
                &self.queue[self.queue_pos..self.queue_next],
                COMPRESS_WINDOW,
                self.max_error,
                self.last_step_clock,
                self.last_ideal_step_clock,
                self.last_interval,
            );
            let mv = wrap_compress(&qr);
            self.check_line(&mv)?;

            let ideal = self.queue[self.queue_pos + mv.count as usize - 1]
                .wrapping_sub(self.last_step_clock as u32);
            self.last_ideal_step_clock = self.last_step_clock.wrapping_add(ideal as u64);
            self.add_move(self.last_step_clock + mv.interval as u64, &mv);

            if self.queue_pos + mv.count as usize >= self.queue_next {
                self.queue_pos = 0;
                self.queue_next = 0;
                break;
            }
            self.queue_pos += mv.count as usize;
        }
        self.calc_last_step_print_time();
        Ok(())
    }

    // Generate a queue_step for a step far in the future
    fn flush_far(&mut self, abs_step_clock: u64) -> Result<()> {
        let mv = StepMove {
            interval: (abs_step_clock - self.last_step_clock) as u32,
            count: 1,
            add: 0,
        };
        self.last_ideal_step_clock = abs_step_clock;
        self.add_move(abs_step_clock, &mv);
        self.calc_last_step_print_time();
        Ok(())
    }

    // Send the set_next_step_dir command
    fn set_next_step_dir(&mut self, sdir: i32) -> Result<()> {
        if self.sdir == sdir {
            return Ok(());
        }
        self.queue_flush(u64::MAX)?;
        self.sdir = sdir;
        let data = [
            self.set_next_step_dir_msgtag as u32,
            self.oid,
            (sdir ^ self.invert_sdir as i32) as u32,
        ];
        let mut msg = Message::encode(&data);
        msg.req_clock = self.last_step_clock;
        self.msg_queue.push_back(msg);
        Ok(())
    }

    fn push_step(&mut self, step_clock: u64) -> Result<()> {
        if self.queue_next >= self.queue.len() {
            self.queue_append_extend()?;
        }
        self.queue[self.queue_next] = step_clock as u32;
        self.queue_next += 1;
        Ok(())
    }

    // Slow path for queue_append() - handle next step far in future
    fn queue_append_far(&mut self, step_clock: u64) -> Result<()> {
        self.queue_flush(step_clock - CLOCK_DIFF_MAX + 1)?;
        if step_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            return self.flush_far(step_clock);
        }
        self.push_step(step_clock)
    }

    // Slow path for queue_append() - make room in the step clock queue
    fn queue_append_extend(&mut self) -> Result<()> {
        if self.queue_next - self.queue_pos > 65535 + 2000 {
            // No point in keeping more than 64K steps in memory
            let flush =
                self.queue[self.queue_next - 65535].wrapping_sub(self.last_step_clock as u32);
            self.queue_flush(self.last_step_clock + flush as u64)?;
        }

        if self.queue_next >= self.queue.len() {
            let in_use = self.queue_next - self.queue_pos;
            if self.queue_pos > 0 {
                // Shuffle the live span to the front of the buffer
                self.queue.copy_within(self.queue_pos..self.queue_next, 0);
            } else {
                // Grow the buffer; it never shrinks
                let mut alloc = self.queue.len();
                if alloc == 0 {
                    alloc = QUEUE_START_SIZE;
                }
                while in_use >= alloc {
                    alloc *= 2;
                }
                self.queue.resize(alloc, 0);
            }
            self.queue_pos = 0;
            self.queue_next = in_use;
        }
        Ok(())
    }

    // Move the pending step into the queue (flushing if needed)
    fn queue_append(&mut self) -> Result<()> {
        if self.next_step_dir != self.sdir {
            self.set_next_step_dir(self.next_step_dir)?;
        }
        let step_clock = self.next_step_clock.take().expect("pending step clock");
        if step_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            return self.queue_append_far(step_clock);
        }
        self.push_step(step_clock)
    }

    /// Add the next step time, subject to the step-dir-step filter.
    pub fn append(&mut self, sdir: i32, print_time: f64, step_time: f64) -> Result<()> {
        // Calculate step clock
        let offset = print_time - self.last_step_print_time;
        let rel_sc = (step_time + offset) * self.mcu_freq;
        let step_clock = self.last_step_clock.wrapping_add(rel_sc as u64);
        // Flush previous pending step (if any)
        if let Some(pending) = self.next_step_clock {
            if sdir != self.next_step_dir {
                let diff = step_clock.wrapping_sub(pending) as i64;
                if (diff as f64) < SDS_FILTER_TIME * self.mcu_freq {
                    // Rollback last step to avoid rapid step+dir+step
                    self.next_step_clock = None;
                    self.next_step_dir = sdir;
                    return Ok(());
                }
            }
            self.queue_append()?;
        }
        // Store this step as the next pending step
        self.next_step_clock = Some(step_clock);
        self.next_step_dir = sdir;
        Ok(())
    }

    /// Commit the pending step; no further rollback is permitted.
    pub fn commit(&mut self) -> Result<()> {
        if self.next_step_clock.is_some() {
            self.queue_append()?;
        }
        Ok(())
    }

    /// Compress and emit all steps scheduled before `move_clock`.
    pub fn flush(&mut self, move_clock: u64) -> Result<()> {
        if let Some(pending) = self.next_step_clock
            && move_clock >= pending
        {
            self.queue_append()?;
        }
        self.queue_flush(move_clock)
    }

    /// Flush everything and re-anchor the clock; the direction becomes
    /// unknown again.
    pub fn reset(&mut self, last_step_clock: u64) -> Result<()> {
        self.flush(u64::MAX)?;
        self.last_step_clock = last_step_clock;
        self.last_interval = 0;
        self.sdir = -1;
        self.calc_last_step_print_time();
        Ok(())
    }

    /// Flush and overwrite the tracked position, leaving a marker in
    /// the history.
    pub fn set_last_position(&mut self, clock: u64, last_position: i64) -> Result<()> {
        self.flush(u64::MAX)?;
        self.last_position = last_position;

        self.history.push_front(HistoryEntry {
            first_clock: clock,
            last_clock: clock,
            start_position: last_position,
            step_count: 0,
            interval: 0,
            add: 0,
        });
        Ok(())
    }

    /// Position of the stepper at a past clock, recovered from the
    /// emitted history.
    pub fn find_past_position(&self, clock: u64) -> i64 {
        let mut last_position = self.last_position;
        for entry in &self.history {
            if clock < entry.first_clock {
                last_position = entry.start_position;
                continue;
            }
            if clock >= entry.last_clock {
                return entry.start_position + entry.step_count as i64;
            }
            let interval = entry.interval;
            let add = entry.add;
            let ticks = (clock.wrapping_sub(entry.first_clock) as i32).wrapping_add(interval);
            let offset = if add == 0 {
                (ticks / interval) as i64
            } else {
                // Solve for the step count with the quadratic formula
                let a = 0.5 * add as f64;
                let b = interval as f64 - 0.5 * add as f64;
                let c = -(ticks as f64);
                (((b * b - 4.0 * a * c).sqrt() - b) / (2.0 * a)) as i64
            };
            return if entry.step_count < 0 {
                entry.start_position - offset
            } else {
                entry.start_position + offset
            };
        }
        last_position
    }

    /// Queue an arbitrary pre-encoded mcu command, ordered with the
    /// stepper's own commands.
    pub fn queue_msg(&mut self, data: &[u32]) -> Result<()> {
        self.flush(u64::MAX)?;

        let mut msg = Message::encode(data);
        msg.req_clock = self.last_step_clock;
        self.msg_queue.push_back(msg);
        Ok(())
    }

    /// History of queue_step commands overlapping a clock range,
    /// newest first.
    pub fn extract_old(&self, max: usize, start_clock: u64, end_clock: u64) -> Vec<PullHistoryStep> {
        let mut res = Vec::new();
        for entry in &self.history {
            if start_clock >= entry.last_clock || res.len() >= max {
                break;
            }
            if end_clock <= entry.first_clock {
                continue;
            }
            res.push(PullHistoryStep {
                first_clock: entry.first_clock,
                last_clock: entry.last_clock,
                start_position: entry.start_position,
                step_count: entry.step_count,
                interval: entry.interval,
                add: entry.add,
            });
        }
        res
    }
}
