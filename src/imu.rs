/// Jump (degrees) between two consecutive readings treated as a wrap-around
pub const WRAP_THRESHOLD_DEG: f64 = 180.0;

/// Readings this close to zero after a jump are a sensor reset, not a wrap
pub const RESET_THRESHOLD_DEG: f64 = 1.0;

const FULL_TURN_DEG: f64 = 360.0;

/// Roll/pitch/yaw of a single IMU, in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl ImuAngles {
    pub fn from_array(a: [f64; 3]) -> Self {
        Self {
            roll: a[0],
            pitch: a[1],
            yaw: a[2],
        }
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.roll, self.pitch, self.yaw]
    }
}

impl Default for ImuAngles {
    fn default() -> Self {
        Self {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        }
    }
}

/// Keeps single-IMU angles continuous across the ±180° boundary.
///
/// The sensor reports each angle in (-180, 180]. When a reading jumps by more
/// than half a turn from the previous one the angle wrapped, so a full turn is
/// folded into a per-axis offset. A jump that lands near zero is a sensor
/// reset and clears the offset instead.
#[derive(Debug, Clone, Default)]
pub struct WrapGuard {
    previous: Option<[f64; 3]>,
    offset: [f64; 3],
}

impl WrapGuard {
    pub fn apply(&mut self, raw: ImuAngles) -> ImuAngles {
        let raw = raw.to_array();
        if let Some(prev) = self.previous {
            for axis in 0..3 {
                let jump = raw[axis] - prev[axis];
                if jump.abs() > WRAP_THRESHOLD_DEG {
                    if raw[axis].abs() > RESET_THRESHOLD_DEG {
                        self.offset[axis] -= FULL_TURN_DEG * jump.signum();
                    } else {
                        self.offset[axis] = 0.0;
                    }
                }
            }
        }
        self.previous = Some(raw);

        ImuAngles::from_array([
            raw[0] + self.offset[0],
            raw[1] + self.offset[1],
            raw[2] + self.offset[2],
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn angles(yaw: f64) -> ImuAngles {
        ImuAngles {
            roll: 0.0,
            pitch: 0.0,
            yaw,
        }
    }

    #[test]
    fn test_imu_angles_default() {
        assert_eq!(ImuAngles::default().to_array(), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_small_changes_pass_through() {
        let mut guard = WrapGuard::default();
        assert_eq!(guard.apply(angles(10.0)).yaw, 10.0);
        assert_eq!(guard.apply(angles(-20.0)).yaw, -20.0);
    }

    #[test]
    fn test_positive_wrap_stays_continuous() {
        let mut guard = WrapGuard::default();
        guard.apply(angles(175.0));
        // sensor wrapped from +175 to -175: continuous value is 185
        assert_eq!(guard.apply(angles(-175.0)).yaw, 185.0);
        assert_eq!(guard.apply(angles(-170.0)).yaw, 190.0);
        // and back across the boundary
        assert_eq!(guard.apply(angles(178.0)).yaw, 178.0);
    }

    #[test]
    fn test_negative_wrap_stays_continuous() {
        let mut guard = WrapGuard::default();
        guard.apply(angles(-179.0));
        assert_eq!(guard.apply(angles(179.0)).yaw, -181.0);
    }

    #[test]
    fn test_reset_clears_offset() {
        let mut guard = WrapGuard::default();
        guard.apply(angles(175.0));
        assert_eq!(guard.apply(angles(-179.75)).yaw, 180.25);
        // a large jump landing on ~0 is a reset, not a wrap
        assert_eq!(guard.apply(angles(0.5)).yaw, 0.5);
    }
}
