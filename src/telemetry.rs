//! # Telemetry snapshot
//!
//! The process-wide, single-writer/many-reader snapshot of the tracker's
//! current fix, environment, and power state (spec.md 3), plus its V1/V2
//! wire encoding for the `SysInfo` host command (spec.md 6).
//!
//! `speed`/`course` are modeled as `Option<f32>` at the Rust level — richer
//! than the original firmware's `-1.0` sentinel convention for "not reported
//! this cycle" — while the wire encoding still emits `-1.0` for `None` so the
//! byte layout below is unchanged from the original.

/// Byte length of the V1 `SysInfo` response.
pub const V1_LEN: usize = 50;
/// Byte length of the V2 `SysInfo` response (version byte + V1 body + extensions).
pub const V2_LEN: usize = 63;

const INVALID_SENTINEL: f32 = -1.0;

/// Process-wide telemetry snapshot (spec.md 3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f32,
    pub satellites: u32,
    pub hdop: f32,
    pub speed_kmh: Option<f32>,
    pub course_deg: Option<f32>,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub location_valid: bool,
    pub date_time_valid: bool,
    pub battery_voltage: f32,
    pub gps_state: u8,
    pub keep_alive_remaining_s: u16,
    pub battery_percent: u8,
    pub is_stationary: bool,
    pub temperature_c: f32,
    pub pressure_pa: f32,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude_m: 0.0,
            satellites: 0,
            hdop: 0.0,
            speed_kmh: None,
            course_deg: None,
            year: 0,
            month: 0,
            day: 0,
            hour: 0,
            minute: 0,
            second: 0,
            location_valid: false,
            date_time_valid: false,
            battery_voltage: 0.0,
            gps_state: 0,
            keep_alive_remaining_s: 0,
            battery_percent: 0,
            is_stationary: false,
            temperature_c: 0.0,
            pressure_pa: 0.0,
        }
    }
}

impl Telemetry {
    /// Encode the V1 (50-byte) `SysInfo` response into `out`.
    pub fn encode_v1(&self, out: &mut [u8; V1_LEN]) {
        out[0..8].copy_from_slice(&self.latitude.to_le_bytes());
        out[8..16].copy_from_slice(&self.longitude.to_le_bytes());
        out[16..20].copy_from_slice(&self.altitude_m.to_le_bytes());
        out[20..24].copy_from_slice(&self.satellites.to_le_bytes());
        out[24..28].copy_from_slice(&self.hdop.to_le_bytes());
        out[28..32].copy_from_slice(&self.speed_kmh.unwrap_or(INVALID_SENTINEL).to_le_bytes());
        out[32..36].copy_from_slice(&self.course_deg.unwrap_or(INVALID_SENTINEL).to_le_bytes());
        out[36..38].copy_from_slice(&self.year.to_le_bytes());
        out[38] = self.month;
        out[39] = self.day;
        out[40] = self.hour;
        out[41] = self.minute;
        out[42] = self.second;
        out[43] = self.location_valid as u8;
        out[44] = self.date_time_valid as u8;
        out[45..49].copy_from_slice(&self.battery_voltage.to_le_bytes());
        out[49] = self.gps_state;
    }

    /// Encode the V2 (63-byte) `SysInfo` response into `out`: a version byte,
    /// the V1 body, then the V2 extensions.
    pub fn encode_v2(&self, out: &mut [u8; V2_LEN]) {
        out[0] = 2;
        let mut v1 = [0u8; V1_LEN];
        self.encode_v1(&mut v1);
        out[1..1 + V1_LEN].copy_from_slice(&v1);
        let tail = 1 + V1_LEN;
        out[tail..tail + 2].copy_from_slice(&self.keep_alive_remaining_s.to_le_bytes());
        out[tail + 2] = self.battery_percent;
        out[tail + 3] = self.is_stationary as u8;
        out[tail + 4..tail + 8].copy_from_slice(&self.temperature_c.to_le_bytes());
        out[tail + 8..tail + 12].copy_from_slice(&self.pressure_pa.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// End-to-end scenario 4 of spec.md 8.
    #[test]
    fn scenario_4_sysinfo_v1_deterministic_bytes() {
        let t = Telemetry {
            latitude: 1.0,
            longitude: 2.0,
            altitude_m: 3.5,
            satellites: 7,
            hdop: 1.25,
            speed_kmh: Some(10.0),
            course_deg: Some(90.0),
            year: 2025,
            month: 9,
            day: 6,
            hour: 12,
            minute: 34,
            second: 56,
            location_valid: true,
            date_time_valid: true,
            battery_voltage: 4.0,
            gps_state: 3,
            ..Telemetry::default()
        };
        let mut out = [0u8; V1_LEN];
        t.encode_v1(&mut out);

        let mut expected = [0u8; V1_LEN];
        expected[0..8].copy_from_slice(&1.0f64.to_le_bytes());
        expected[8..16].copy_from_slice(&2.0f64.to_le_bytes());
        expected[16..20].copy_from_slice(&3.5f32.to_le_bytes());
        expected[20..24].copy_from_slice(&7u32.to_le_bytes());
        expected[24..28].copy_from_slice(&1.25f32.to_le_bytes());
        expected[28..32].copy_from_slice(&10.0f32.to_le_bytes());
        expected[32..36].copy_from_slice(&90.0f32.to_le_bytes());
        expected[36..38].copy_from_slice(&2025u16.to_le_bytes());
        expected[38] = 9;
        expected[39] = 6;
        expected[40] = 12;
        expected[41] = 34;
        expected[42] = 56;
        expected[43] = 1;
        expected[44] = 1;
        expected[45..49].copy_from_slice(&4.0f32.to_le_bytes());
        expected[49] = 3;

        assert_eq!(out, expected);
    }

    #[test]
    fn invalid_speed_and_course_encode_as_negative_one() {
        let t = Telemetry { speed_kmh: None, course_deg: None, ..Telemetry::default() };
        let mut out = [0u8; V1_LEN];
        t.encode_v1(&mut out);
        assert_eq!(&out[28..32], &(-1.0f32).to_le_bytes());
        assert_eq!(&out[32..36], &(-1.0f32).to_le_bytes());
    }

    #[test]
    fn v2_is_63_bytes_and_starts_with_version_2() {
        let t = Telemetry::default();
        let mut out = [0u8; V2_LEN];
        t.encode_v2(&mut out);
        assert_eq!(out[0], 2);
        assert_eq!(out.len(), V2_LEN);
    }

    #[test]
    fn v2_body_matches_v1_encoding() {
        let t = Telemetry { satellites: 9, gps_state: 2, ..Telemetry::default() };
        let mut v1 = [0u8; V1_LEN];
        t.encode_v1(&mut v1);
        let mut v2 = [0u8; V2_LEN];
        t.encode_v2(&mut v2);
        assert_eq!(&v2[1..1 + V1_LEN], &v1);
    }
}
