//! Scaling policy — how many runners a group's demand calls for.

/// Pure mapping from demand to a desired runner count.
///
/// `provisioned` is the number of runners already active or requested,
/// so policies can add hysteresis without extra state.
pub trait ScalingPolicy: Send + Sync {
    fn desired_runners(&self, wanted_mb: i64, provisioned: usize, capacity_per_runner_mb: i64) -> usize;
}

impl<F> ScalingPolicy for F
where
    F: Fn(i64, usize, i64) -> usize + Send + Sync,
{
    fn desired_runners(&self, wanted_mb: i64, provisioned: usize, capacity_per_runner_mb: i64) -> usize {
        self(wanted_mb, provisioned, capacity_per_runner_mb)
    }
}

/// Just enough runners to cover the demand, clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConservativePolicy {
    pub min_runners: usize,
    pub max_runners: Option<usize>,
}

impl ConservativePolicy {
    pub fn new(min_runners: usize, max_runners: Option<usize>) -> Self {
        Self {
            min_runners,
            max_runners,
        }
    }
}

impl ScalingPolicy for ConservativePolicy {
    fn desired_runners(&self, wanted_mb: i64, _provisioned: usize, capacity_per_runner_mb: i64) -> usize {
        let needed = if wanted_mb <= 0 {
            0
        } else {
            let per_runner = capacity_per_runner_mb.max(1) as u64;
            usize::try_from((wanted_mb as u64).div_ceil(per_runner)).unwrap_or(usize::MAX)
        };

        let floored = needed.max(self.min_runners);
        match self.max_runners {
            Some(max) => floored.min(max),
            None => floored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_whole_runners() {
        let p = ConservativePolicy::default();
        assert_eq!(p.desired_runners(0, 0, 4096), 0);
        assert_eq!(p.desired_runners(1, 0, 4096), 1);
        assert_eq!(p.desired_runners(4096, 0, 4096), 1);
        assert_eq!(p.desired_runners(4097, 0, 4096), 2);
    }

    #[test]
    fn negative_demand_means_no_runners() {
        assert_eq!(ConservativePolicy::default().desired_runners(-50, 3, 4096), 0);
    }

    #[test]
    fn clamps_to_bounds() {
        let p = ConservativePolicy::new(2, Some(5));
        assert_eq!(p.desired_runners(0, 0, 4096), 2);
        assert_eq!(p.desired_runners(100 * 4096, 0, 4096), 5);
    }

    #[test]
    fn closures_are_policies() {
        let keep_one_spare = |wanted: i64, _: usize, per: i64| (wanted / per) as usize + 1;
        assert_eq!(keep_one_spare.desired_runners(8192, 0, 4096), 3);
    }
}
