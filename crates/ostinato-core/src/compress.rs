//! Step schedule compression search.
//!
//! The mcu step primitive replays `count` pulses with
//! `t += interval; interval += add`, so a run of queued step clocks has
//! to be covered by (interval, count, add) triples. The search below
//! jointly fits two consecutive (add, count) segments by least squares
//! on the per-step ideal intervals, maximizing the number of queued
//! steps the pair covers while keeping every reproduced pulse inside
//! its tolerance window and `add` inside the signed 16-bit wire range.
//!
//! All offsets are 32-bit and computed with wrapping subtraction from
//! the cursor's `last_step_clock`; callers guarantee the window spans
//! less than `CLOCK_DIFF_MAX` ticks, so the offsets stay small even
//! when the absolute 64-bit clocks do not.

/// Number of queued steps a single compression pass may look at.
pub(crate) const COMPRESS_WINDOW: usize = 46000;

/// One mcu `queue_step` command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct StepMove {
    pub interval: u32,
    pub count: u16,
    pub add: i16,
}

/// Search-internal (add, count) segment before it is folded into a
/// `StepMove`.
#[derive(Copy, Clone, Debug)]
struct AddMove {
    add: i32,
    count: i32,
}

/// Acceptable window for a single step, as offsets from the cursor's
/// `last_step_clock`. `maxp` is the ideal step time.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Points {
    pub minp: i32,
    pub maxp: i32,
}

// n/d rounding up, correct for negative n
fn idiv_up(n: i64, d: i64) -> i64 {
    if n >= 0 { (n + d - 1) / d } else { n / d }
}

// n/d rounding down, correct for negative n
fn idiv_down(n: i64, d: i64) -> i64 {
    if n >= 0 { n / d } else { (n - d + 1) / d }
}

// n/d rounding up for non-negative operands
fn div_round_up(n: i64, d: i64) -> i64 {
    (n + d - 1) / d
}

/// Read-only cursor over a window of queued step clocks plus the clock
/// state the next command would start from.
#[derive(Copy, Clone)]
pub(crate) struct QueueRef<'a> {
    steps: &'a [u32],
    max_error: u32,
    last_step_clock: u64,
    last_ideal_step_clock: u64,
    last_interval: u32,
}

impl<'a> QueueRef<'a> {
    pub fn new(
        steps: &'a [u32],
        max_count: usize,
        max_error: u32,
        last_step_clock: u64,
        last_ideal_step_clock: u64,
        last_interval: u32,
    ) -> Self {
        let end = steps.len().min(max_count);
        QueueRef {
            steps: &steps[..end],
            max_error,
            last_step_clock,
            last_ideal_step_clock,
            last_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Tolerance window for the step at `idx`.
    pub fn minmax_point(&self, idx: usize) -> Points {
        let lsc = self.last_step_clock as u32;
        let point = self.steps[idx].wrapping_sub(lsc);
        let prevpoint = if idx > 0 {
            self.steps[idx - 1].wrapping_sub(lsc)
        } else {
            0
        };
        let max_error = (point.wrapping_sub(prevpoint) / 2).min(self.max_error);
        Points {
            minp: point.wrapping_sub(max_error) as i32,
            maxp: point as i32,
        }
    }

    /// Ticks from the previous ideal step time to the step at `idx`.
    fn ideal_interval(&self, idx: usize) -> i32 {
        if idx > 0 {
            self.steps[idx].wrapping_sub(self.steps[idx - 1]) as i32
        } else {
            self.steps[0].wrapping_sub(self.last_ideal_step_clock as u32) as i32
        }
    }

    /// Cursor state after an (add, count) segment is scheduled.
    fn after_move(&self, am: AddMove) -> QueueRef<'a> {
        if am.count <= 0 {
            return *self;
        }
        let count = am.count as usize;
        let addfactor = am.count.wrapping_mul(am.count + 1) / 2;
        let ideal = self.steps[count - 1].wrapping_sub(self.last_step_clock as u32);
        let ticks = self
            .last_interval
            .wrapping_mul(am.count as u32)
            .wrapping_add(addfactor.wrapping_mul(am.add) as u32);
        QueueRef {
            steps: &self.steps[count..],
            max_error: self.max_error,
            last_step_clock: self.last_step_clock.wrapping_add(ticks as u64),
            last_ideal_step_clock: self.last_step_clock.wrapping_add(ideal as u64),
            last_interval: self
                .last_interval
                .wrapping_add(am.count.wrapping_mul(am.add) as u32),
        }
    }
}

/// Feasible `add` interval for a single (add, count) segment starting
/// at the cursor.
struct AddRange {
    minadd: i32,
    maxadd: i32,
    count: i32,
}

impl AddRange {
    fn new() -> Self {
        AddRange {
            minadd: -0x8000,
            maxadd: 0x7fff,
            count: 0,
        }
    }

    /// Try to extend the segment by one step. Returns false once the
    /// window is exhausted or the feasible interval collapses.
    fn update(&mut self, qr: &QueueRef) -> bool {
        if self.count as usize >= qr.len() {
            return false;
        }
        let nextpoint = qr.minmax_point(self.count as usize);

        let nextcount = self.count as i64 + 1;
        let nextaddfactor = nextcount * (nextcount + 1) / 2;
        let interval = qr.last_interval as i32 as i64;
        let mut nextminadd = self.minadd as i64;
        let mut nextmaxadd = self.maxadd as i64;
        if interval * nextcount + nextminadd * nextaddfactor < nextpoint.minp as i64 {
            nextminadd = idiv_up(nextpoint.minp as i64 - interval * nextcount, nextaddfactor);
        }
        if interval * nextcount + nextmaxadd * nextaddfactor > nextpoint.maxp as i64 {
            nextmaxadd = idiv_down(nextpoint.maxp as i64 - interval * nextcount, nextaddfactor);
        }
        if nextminadd > nextmaxadd {
            return false;
        }
        self.minadd = nextminadd as i32;
        self.maxadd = nextmaxadd as i32;
        self.count = nextcount as i32;
        true
    }

    /// Longest single-segment schedule the cursor admits.
    fn scan(qr: &QueueRef) -> AddRange {
        let mut ar = AddRange::new();
        while ar.update(qr) {}
        ar
    }
}

// Step time after an add1,count1 then add2,count2 schedule
fn calc_seq(qr: &QueueRef, add1: i64, add2: i64, c1: i64, tc: i64) -> i64 {
    let ad = add1 - add2;
    let addfactor = tc * (tc + 1) / 2;
    let paddfactor = c1 * (c1 - 1) / 2;
    (qr.last_interval as i32 as i64) * tc + add2 * addfactor + ad * (c1 * tc - paddfactor)
}

// The least-squares search looks for the add1,count1 segment that,
// followed by an add2,count2 segment, best reproduces the queued step
// times. For each step there is one equation of the form
//   add1*ac1 + add2*ac2 = adjusted_ideal_interval
// where ac1, ac2 and the adjusted ideal interval are constants for
// that step; the variance/covariance sums below are maintained
// incrementally as count1 grows.

/// Estimate the best add1,count1 for covering `totalcount` steps.
fn calc_leastsquares(qr: &QueueRef, totalcount: i32) -> AddMove {
    let last_interval = qr.last_interval as i32 as i64;

    // Initial sums with count1 = 0 (every step belongs to segment 2)
    let mut var_ac1 = 0.0f64;
    let mut var_ac2 = 0.0f64;
    let mut cov_ac1_ac2 = 0.0f64;
    let mut cov_ac1_aii = 0.0f64;
    let mut cov_ac2_aii = 0.0f64;
    let mut sum_aii = 0.0f64;
    for step in 1..=totalcount {
        let aii = qr.ideal_interval(step as usize - 1) as i64 - last_interval;
        let dac2 = step as f64;
        let daii = aii as f64;
        cov_ac2_aii += dac2 * daii;
        var_ac2 += dac2 * dac2;
        sum_aii += daii;
    }
    let mut condsum_aii = sum_aii;

    // Solve on each feasible count1 and keep the best solution
    let mut ar = AddRange::new();
    let mut best_e2 = f64::MAX;
    let mut best = AddMove { add: 0, count: 0 };
    loop {
        if !ar.update(qr) {
            // Can not further increase count1 - return best result found
            return best;
        }
        let count1 = ar.count;

        // Shift the step at count1 from segment 2 into segment 1
        let aii = qr.ideal_interval(count1 as usize - 1) as i64 - last_interval;
        cov_ac2_aii -= condsum_aii;
        cov_ac1_aii += condsum_aii;
        condsum_aii -= aii as f64;
        let pc2 = (totalcount - count1 + 1) as i64;
        let paf = pc2 * (pc2 + 1) / 2;
        let va_diff = pc2 * pc2;
        let caa_diff = paf - count1 as i64 * pc2;
        cov_ac1_ac2 += caa_diff as f64;
        var_ac2 -= va_diff as f64;
        var_ac1 += (va_diff - 2 * caa_diff) as f64;

        // Calculate add1 and constrain it to the feasible range
        let mut dadd2 = 0.0f64;
        if count1 < totalcount {
            let determinant = var_ac1 * var_ac2 - cov_ac1_ac2 * cov_ac1_ac2;
            let v = var_ac1 * cov_ac2_aii - cov_ac1_ac2 * cov_ac1_aii;
            dadd2 = (v / determinant).round();
        }
        let dadd1 = ((cov_ac1_aii - dadd2 * cov_ac1_ac2) / var_ac1).round();
        let add1 = (dadd1 as i32).clamp(ar.minadd, ar.maxadd);
        let dadd1 = add1 as f64;

        // Recalculate add2 and repair the final step into its window
        if count1 < totalcount {
            dadd2 = ((cov_ac2_aii - dadd1 * cov_ac1_ac2) / var_ac2).round();
        }
        let mut add2 = dadd2 as i64;
        let lastr = qr.minmax_point(totalcount as usize - 1);
        let lastp = calc_seq(qr, add1 as i64, add2, count1 as i64, totalcount as i64);
        let count2 = (totalcount - count1) as i64;
        let af = count2 * (count2 + 1) / 2;
        if lastp < lastr.minp as i64 {
            if lastp + af > lastr.maxp as i64 {
                continue;
            }
            add2 += div_round_up(lastr.minp as i64 - lastp, af);
        } else if lastp > lastr.maxp as i64 {
            if lastp - af < lastr.minp as i64 {
                continue;
            }
            add2 -= div_round_up(lastp - lastr.maxp as i64, af);
        }
        let dadd2 = add2 as f64;

        // Relative squared error; var_aii is constant across candidates
        // and therefore elided
        let rel_error2 = dadd1 * dadd1 * var_ac1 + dadd2 * dadd2 * var_ac2
            + 2.0 * dadd1 * dadd2 * cov_ac1_ac2
            - 2.0 * dadd1 * cov_ac1_aii
            - 2.0 * dadd2 * cov_ac2_aii;
        if rel_error2 <= best_e2 {
            best.add = add1;
            best.count = count1;
            best_e2 = rel_error2;
        }
    }
}

/// Search for the (add, count) segment that maximizes the total number
/// of steps covered once a second segment follows it.
fn compress_leastsquares(qr: &QueueRef) -> AddMove {
    // Longest valid single-segment count
    let outer_ar1 = AddRange::scan(qr);
    let outer_count1 = outer_ar1.count;
    if outer_count1 == 0 {
        // Lone step; schedule it max_error/2 before its ideal time
        let interval = qr.steps[0].wrapping_sub(qr.last_step_clock as u32);
        let st = interval
            .wrapping_sub(qr.last_interval)
            .wrapping_sub(qr.max_error / 2);
        return AddMove {
            add: st as i32,
            count: 1,
        };
    }

    // Grow totalcount by repeatedly re-running least squares on the
    // reach of the previous solution
    let outer_add1 = (outer_ar1.minadd + outer_ar1.maxadd) / 2;
    let mut prev = AddMove {
        add: outer_add1,
        count: outer_count1,
    };
    let mut next = prev;
    let mut prev_totalcount = 0;
    loop {
        // Maximum reachable totalcount given the tentative segment
        let qr2 = qr.after_move(next);
        let ar = AddRange::scan(&qr2);
        let totalcount = next.count + ar.count;

        if prev_totalcount >= totalcount {
            return prev;
        }
        prev = next;
        prev_totalcount = totalcount;
        next = calc_leastsquares(qr, totalcount);
    }
}

/// Compress the head of the queue into a single mcu `queue_step`.
///
/// The mcu applies `add` after each pulse, so a segment's `add` is
/// absorbed into the starting interval and the first reproduced pulse
/// lands exactly where the search placed it.
pub(crate) fn wrap_compress(qr: &QueueRef) -> StepMove {
    let am1 = compress_leastsquares(qr);
    if am1.count == 1 && qr.len() > 1 {
        // A one-step lead-in may fuse with the following segment
        let qr2 = qr.after_move(am1);
        let am2 = compress_leastsquares(&qr2);
        if am2.add >= -0x8000 && am2.add <= 0x7fff {
            return StepMove {
                interval: qr.last_interval.wrapping_add(am1.add as u32),
                count: (am2.count + 1) as u16,
                add: am2.add as i16,
            };
        }
    }

    StepMove {
        interval: qr.last_interval.wrapping_add(am1.add as u32),
        count: am1.count as u16,
        add: if am1.count > 1 { am1.add as i16 } else { 0 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(steps: &[u32], max_error: u32, last_interval: u32) -> QueueRef<'_> {
        QueueRef::new(steps, COMPRESS_WINDOW, max_error, 0, 0, last_interval)
    }

    #[test]
    fn idiv_rounds_like_the_mcu_host() {
        assert_eq!(idiv_up(7, 2), 4);
        assert_eq!(idiv_up(6, 2), 3);
        assert_eq!(idiv_up(-7, 2), -3);
        assert_eq!(idiv_down(7, 2), 3);
        assert_eq!(idiv_down(-7, 2), -4);
        assert_eq!(idiv_down(-6, 2), -3);
    }

    #[test]
    fn constant_rate_collapses_to_one_move() {
        let steps: Vec<u32> = (1..=10).map(|i| i * 1000).collect();
        let qr = window(&steps, 25, 0);
        let mv = wrap_compress(&qr);
        assert_eq!(
            mv,
            StepMove {
                interval: 1000,
                count: 10,
                add: 0
            }
        );
    }

    #[test]
    fn linear_deceleration_collapses_to_one_move() {
        // Intervals 1000, 900, 800, 700, 600: a lone lead-in step fused
        // with a four-step ramp covers the whole run
        let steps = [1000, 1900, 2700, 3400, 4000];
        let qr = window(&steps, 10, 0);
        let mv = wrap_compress(&qr);
        assert_eq!(
            mv,
            StepMove {
                interval: 995,
                count: 5,
                add: -98
            }
        );
    }

    #[test]
    fn replayed_pulses_stay_in_their_windows() {
        let steps = [1000, 1900, 2700, 3400, 4000];
        let qr = window(&steps, 10, 0);
        let mv = wrap_compress(&qr);
        let mut interval = mv.interval as i64;
        let mut p = 0i64;
        for i in 0..mv.count as usize {
            let point = qr.minmax_point(i);
            p += interval;
            assert!(p >= point.minp as i64 && p <= point.maxp as i64);
            interval += mv.add as i64;
        }
    }

    #[test]
    fn infeasible_first_step_degenerates_to_a_lone_move() {
        // Too far for any 16-bit add ramp from a standstill
        let steps = [100_000];
        let qr = window(&steps, 100, 0);
        let mv = wrap_compress(&qr);
        assert_eq!(
            mv,
            StepMove {
                interval: 100_000 - 50,
                count: 1,
                add: 0
            }
        );
    }

    #[test]
    fn lead_in_step_fuses_with_following_ramp() {
        // First interval 2000, then a steady 1000 cadence. The lone
        // lead-in cannot ramp to the cadence with one add, so it fuses
        // with the next one-step segment into a count=2 move whose
        // starting interval absorbs the first offset.
        let steps: Vec<u32> = (0..10).map(|i| 2000 + i * 1000).collect();
        let qr = window(&steps, 25, 0);
        let mv = wrap_compress(&qr);
        assert_eq!(mv.count, 2);
        assert!(mv.add < 0);
        let mut interval = mv.interval as i64;
        let mut p = 0i64;
        for i in 0..mv.count as usize {
            let point = qr.minmax_point(i);
            p += interval;
            assert!(p >= point.minp as i64 && p <= point.maxp as i64);
            interval += mv.add as i64;
        }
    }

    #[test]
    fn window_offsets_survive_clock_wraparound() {
        // Absolute clocks near the 32-bit boundary; offsets still small
        let base = 0xffff_ff00u32;
        let steps: Vec<u32> = (1..=8).map(|i| base.wrapping_add(i * 1000)).collect();
        let qr = QueueRef::new(&steps, COMPRESS_WINDOW, 25, base as u64, base as u64, 0);
        let mv = wrap_compress(&qr);
        assert_eq!(mv.count, 8);
        assert_eq!(mv.interval, 1000);
    }
}
