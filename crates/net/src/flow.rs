//! Two-mode adaptive send-rate governor driven by observed RTT.

/// Send-rate regime. `Good` is optimistic, `Bad` is conservative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    Good,
    Bad,
}

/// RTT threshold in seconds separating good from bad conditions.
///
/// The original protocol compared a raw `255.0` against an RTT measured in
/// seconds, which can never trip; the threshold here is a parameter and the
/// default assumes milliseconds were intended.
pub const DEFAULT_RTT_THRESHOLD: f32 = 0.25;

const GOOD_SEND_RATE: f32 = 30.0;
const BAD_SEND_RATE: f32 = 10.0;
const MIN_PENALTY_TIME: f32 = 1.0;
const MAX_PENALTY_TIME: f32 = 60.0;
const PENALTY_REDUCTION_INTERVAL: f32 = 10.0;
const RAPID_FLAP_WINDOW: f32 = 10.0;
const INITIAL_PENALTY_TIME: f32 = 4.0;

#[derive(Debug)]
pub struct FlowControl {
    mode: FlowMode,
    rtt_threshold: f32,
    penalty_time: f32,
    good_conditions_time: f32,
    penalty_reduction_accumulator: f32,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_RTT_THRESHOLD)
    }
}

impl FlowControl {
    pub fn new(rtt_threshold: f32) -> Self {
        let mut flow = Self {
            mode: FlowMode::Bad,
            rtt_threshold,
            penalty_time: INITIAL_PENALTY_TIME,
            good_conditions_time: 0.0,
            penalty_reduction_accumulator: 0.0,
        };
        flow.reset();
        flow
    }

    pub fn reset(&mut self) {
        self.mode = FlowMode::Bad;
        self.penalty_time = INITIAL_PENALTY_TIME;
        self.good_conditions_time = 0.0;
        self.penalty_reduction_accumulator = 0.0;
    }

    /// Advances the governor by `dt` seconds given the current RTT estimate
    /// in seconds.
    pub fn update(&mut self, dt: f32, rtt: f32) {
        match self.mode {
            FlowMode::Good => self.update_good(dt, rtt),
            FlowMode::Bad => self.update_bad(dt, rtt),
        }
    }

    fn update_good(&mut self, dt: f32, rtt: f32) {
        if rtt > self.rtt_threshold {
            log::debug!("flow control dropping to bad mode (rtt {:.3}s)", rtt);
            self.mode = FlowMode::Bad;
            if self.good_conditions_time < RAPID_FLAP_WINDOW
                && self.penalty_time < MAX_PENALTY_TIME
            {
                self.penalty_time = (self.penalty_time * 2.0).min(MAX_PENALTY_TIME);
                log::debug!("penalty time increased to {:.1}s", self.penalty_time);
            }
            self.good_conditions_time = 0.0;
            self.penalty_reduction_accumulator = 0.0;
            return;
        }

        self.good_conditions_time += dt;
        self.penalty_reduction_accumulator += dt;

        if self.penalty_reduction_accumulator > PENALTY_REDUCTION_INTERVAL
            && self.penalty_time > MIN_PENALTY_TIME
        {
            self.penalty_time = (self.penalty_time / 2.0).max(MIN_PENALTY_TIME);
            log::debug!("penalty time reduced to {:.1}s", self.penalty_time);
            self.penalty_reduction_accumulator = 0.0;
        }
    }

    fn update_bad(&mut self, dt: f32, rtt: f32) {
        if rtt <= self.rtt_threshold {
            self.good_conditions_time += dt;
        } else {
            self.good_conditions_time = 0.0;
        }

        if self.good_conditions_time > self.penalty_time {
            log::debug!("flow control recovering to good mode");
            self.good_conditions_time = 0.0;
            self.penalty_reduction_accumulator = 0.0;
            self.mode = FlowMode::Good;
        }
    }

    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    pub fn penalty_time(&self) -> f32 {
        self.penalty_time
    }

    /// Packets-per-second budget for the caller to throttle against.
    pub fn send_rate(&self) -> f32 {
        match self.mode {
            FlowMode::Good => GOOD_SEND_RATE,
            FlowMode::Bad => BAD_SEND_RATE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_RTT: f32 = 0.05;
    const BAD_RTT: f32 = 0.5;

    fn drive(flow: &mut FlowControl, seconds: f32, rtt: f32) {
        let step = 0.1;
        let mut elapsed = 0.0;
        while elapsed < seconds {
            flow.update(step, rtt);
            elapsed += step;
        }
    }

    #[test]
    fn test_starts_in_bad_mode() {
        let flow = FlowControl::default();
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.send_rate(), 10.0);
    }

    #[test]
    fn test_recovers_after_penalty_time() {
        let mut flow = FlowControl::default();
        let penalty = flow.penalty_time();

        drive(&mut flow, penalty - 0.2, GOOD_RTT);
        assert_eq!(flow.mode(), FlowMode::Bad);

        drive(&mut flow, 0.5, GOOD_RTT);
        assert_eq!(flow.mode(), FlowMode::Good);
        assert_eq!(flow.send_rate(), 30.0);
    }

    #[test]
    fn test_bad_rtt_resets_recovery_clock() {
        let mut flow = FlowControl::default();
        let penalty = flow.penalty_time();
        drive(&mut flow, penalty - 0.2, GOOD_RTT);
        flow.update(0.1, BAD_RTT);
        drive(&mut flow, 0.5, GOOD_RTT);
        assert_eq!(flow.mode(), FlowMode::Bad);
    }

    #[test]
    fn test_rapid_flap_doubles_penalty() {
        let mut flow = FlowControl::default();
        let initial_penalty = flow.penalty_time();

        drive(&mut flow, initial_penalty + 0.5, GOOD_RTT);
        assert_eq!(flow.mode(), FlowMode::Good);

        // One bad sample after a short good streak.
        flow.update(0.1, BAD_RTT);
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.penalty_time(), initial_penalty * 2.0);
    }

    #[test]
    fn test_penalty_capped_at_ceiling() {
        let mut flow = FlowControl::default();
        for _ in 0..16 {
            let penalty = flow.penalty_time();
            drive(&mut flow, penalty + 0.5, GOOD_RTT);
            flow.update(0.1, BAD_RTT);
        }
        assert!(flow.penalty_time() <= 60.0);
    }

    #[test]
    fn test_long_good_conditions_halve_penalty() {
        let mut flow = FlowControl::default();
        let initial_penalty = flow.penalty_time();

        drive(&mut flow, initial_penalty + 0.5, GOOD_RTT);
        assert_eq!(flow.mode(), FlowMode::Good);

        drive(&mut flow, 10.5, GOOD_RTT);
        assert!(flow.penalty_time() < initial_penalty);
        assert!(flow.penalty_time() >= 1.0);
    }
}
