use std::collections::BTreeMap;

/// Number of floats in every command frame sent to the simulator
pub const COMMAND_LEN: usize = 10;

/// Fixed-length command payload; unused trailing slots stay at zero
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CommandVector {
    data: [f32; COMMAND_LEN],
}

impl CommandVector {
    pub fn zeros() -> Self {
        Self::default()
    }

    pub fn from_array(data: [f32; COMMAND_LEN]) -> Self {
        Self { data }
    }

    /// Place each output channel at its position in `ordering`.
    /// Channels missing from `values` are left at zero; names not in
    /// `ordering` are dropped.
    pub fn from_channels(values: &BTreeMap<String, f32>, ordering: &[String]) -> Self {
        let mut data = [0.0f32; COMMAND_LEN];
        for (slot, name) in data.iter_mut().zip(ordering.iter()) {
            if let Some(v) = values.get(name) {
                *slot = *v;
            }
        }
        Self { data }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        COMMAND_LEN
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Numeric row as recorded in the control history
    pub fn to_row(&self) -> Vec<f64> {
        self.data.iter().map(|&v| v as f64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reindex_by_ordering() {
        let ordering = vec!["roll".to_string(), "pitch".to_string()];
        let mut values = BTreeMap::new();
        values.insert("pitch".to_string(), 0.5);
        values.insert("roll".to_string(), -0.25);

        let cmd = CommandVector::from_channels(&values, &ordering);
        assert_eq!(cmd.len(), COMMAND_LEN);
        assert_eq!(cmd.as_slice()[0], -0.25);
        assert_eq!(cmd.as_slice()[1], 0.5);
        assert!(cmd.as_slice()[2..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_missing_channel_left_zero() {
        let ordering = vec!["roll".to_string(), "pitch".to_string(), "yaw".to_string()];
        let mut values = BTreeMap::new();
        values.insert("yaw".to_string(), 1.0);
        values.insert("thrust".to_string(), 3.0);

        let cmd = CommandVector::from_channels(&values, &ordering);
        assert_eq!(cmd.as_slice()[..3], [0.0, 0.0, 1.0]);
        assert_eq!(cmd.as_slice().iter().filter(|&&x| x != 0.0).count(), 1);
    }
}
