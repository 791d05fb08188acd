//! Per-kind device state, typed commands and fail-safe behavior.
//!
//! Every command payload starts with an opcode byte; arguments follow,
//! multi-byte values little-endian. The hub keeps a mirror of each device's
//! state: it is updated after a command is sent successfully and from
//! unsolicited Status reports (command id 0).
//!
//! | kind     | fail-safe                      |
//! |----------|--------------------------------|
//! | Light    | all channels off               |
//! | CO2      | emergency stop (valve closed)  |
//! | Heater   | manual off                     |
//! | Feeder   | cancel feeding                 |
//! | Doser    | stop pumps                     |
//! | Sensor   | none (read-only)               |
//! | Repeater | none (keeps relaying)          |
//! | Filter   | none (keeps running)           |

use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::protocol::{NodeType, Status};

pub mod opcodes {
    pub mod light {
        pub const ALL_OFF: u8 = 0;
        pub const ALL_ON: u8 = 1;
        pub const CH1_OFF: u8 = 10;
        pub const CH1_ON: u8 = 11;
        pub const CH2_OFF: u8 = 20;
        pub const CH2_ON: u8 = 21;
        pub const CH3_OFF: u8 = 30;
        pub const CH3_ON: u8 = 31;
    }
    pub mod co2 {
        pub const START: u8 = 0x01;
        pub const STOP: u8 = 0x02;
        pub const TIMED: u8 = 0x03;
        pub const EMERGENCY_STOP: u8 = 0xFF;
    }
    pub mod heater {
        pub const SET_MODE: u8 = 0x01;
        pub const SET_TARGET: u8 = 0x02;
        pub const SET_HYSTERESIS: u8 = 0x03;
        pub const MANUAL_ON: u8 = 0x04;
        pub const MANUAL_OFF: u8 = 0x05;
        pub const ENABLE_AUTO: u8 = 0x06;
    }
    pub mod feeder {
        pub const FEED: u8 = 0x01;
        pub const TEST: u8 = 0x02;
        pub const CANCEL: u8 = 0x03;
    }
    pub mod sensor {
        pub const REQUEST_READING: u8 = 0x01;
        pub const SET_INTERVAL: u8 = 0x02;
    }
    pub mod repeater {
        pub const SET_ACTIVE: u8 = 0x01;
        pub const RESET_STATS: u8 = 0x02;
        pub const REQUEST_STATS: u8 = 0x03;
    }
    pub mod doser {
        pub const DOSE: u8 = 0x01;
        pub const STOP: u8 = 0x02;
    }
    pub mod filter {
        pub const ON: u8 = 0x01;
        pub const OFF: u8 = 0x02;
    }
}

use opcodes::*;

pub const MAX_CO2_INJECTION_SECS: u16 = 3600;
pub const HEATER_MIN_TARGET: f32 = 18.0;
pub const HEATER_MAX_TARGET: f32 = 35.0;
pub const MAX_FEED_PORTIONS: u8 = 5;
pub const MIN_FEED_INTERVAL_SECS: u64 = 3600;
const SENSOR_HISTORY: usize = 48;

// ---------------------------------------------------------------- commands

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightCommand {
    AllOff,
    AllOn,
    /// `channel` is 1-3.
    Channel { channel: u8, on: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Co2Command {
    /// Open the valve; the node closes it again after `duration_secs`.
    Start { duration_secs: u16 },
    Stop,
    Timed { duration_secs: u16 },
    EmergencyStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaterMode {
    #[default]
    Off,
    Auto,
    Manual,
}

impl HeaterMode {
    fn as_u8(self) -> u8 {
        match self {
            HeaterMode::Off => 0,
            HeaterMode::Auto => 1,
            HeaterMode::Manual => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeaterCommand {
    SetMode(HeaterMode),
    SetTarget(f32),
    SetHysteresis(f32),
    ManualOn,
    ManualOff,
    EnableAuto(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederCommand {
    Feed { portions: u8 },
    Test,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    RequestReading,
    SetInterval { seconds: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeaterCommand {
    SetActive(bool),
    ResetStats,
    RequestStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoserCommand {
    Dose { milliliters: u16 },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCommand {
    On,
    Off,
}

/// A typed command for one device kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    Light(LightCommand),
    Co2(Co2Command),
    Heater(HeaterCommand),
    Feeder(FeederCommand),
    Sensor(SensorCommand),
    Repeater(RepeaterCommand),
    Doser(DoserCommand),
    Filter(FilterCommand),
}

// ---------------------------------------------------------------- state

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightState {
    /// Brightness per channel, 0-100.
    pub channels: [u8; 3],
    pub enabled: bool,
}

impl Default for LightState {
    fn default() -> Self {
        Self {
            channels: [0; 3],
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InjectionState {
    #[default]
    Off,
    On,
    Timed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Co2State {
    pub state: InjectionState,
    pub injection_started_at: u64,
    pub injection_duration_secs: u16,
    pub total_injection_secs: u64,
    pub injection_count: u32,
}

impl Co2State {
    pub fn is_injecting(&self) -> bool {
        matches!(self.state, InjectionState::On | InjectionState::Timed)
    }

    fn close(&mut self, now: u64) {
        if self.is_injecting() {
            let elapsed = now.saturating_sub(self.injection_started_at) / 1000;
            let capped = if self.injection_duration_secs > 0 {
                elapsed.min(u64::from(self.injection_duration_secs))
            } else {
                elapsed
            };
            self.total_injection_secs += capped;
        }
        self.state = InjectionState::Off;
        self.injection_duration_secs = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaterState {
    pub mode: HeaterMode,
    pub heating: bool,
    pub target_temperature: f32,
    pub hysteresis: f32,
    pub current_temperature: Option<f32>,
    pub heating_cycles: u32,
}

impl Default for HeaterState {
    fn default() -> Self {
        Self {
            mode: HeaterMode::Off,
            heating: false,
            target_temperature: 25.0,
            hysteresis: 0.5,
            current_temperature: None,
            heating_cycles: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeederActivity {
    #[default]
    Idle,
    Feeding,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeederState {
    pub state: FeederActivity,
    pub last_portions: u8,
    pub last_feed_at: u64,
    pub total_feedings: u32,
    pub total_portions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub temperature: f32,
    pub ph: f32,
    pub tds: u16,
    pub timestamp: u64,
}

impl SensorReading {
    /// `[ph_int, ph_frac, tds_lo, tds_hi, temp_int, temp_frac]`, fractions in hundredths.
    pub fn from_status(data: &[u8], now: u64) -> Option<Self> {
        if data.len() < 6 {
            return None;
        }
        Some(Self {
            ph: f32::from(data[0]) + f32::from(data[1]) / 100.0,
            tds: u16::from_le_bytes([data[2], data[3]]),
            temperature: f32::from(data[4]) + f32::from(data[5]) / 100.0,
            timestamp: now,
        })
    }

    pub fn is_plausible(&self) -> bool {
        (0.0..=14.0).contains(&self.ph) && (0.0..=50.0).contains(&self.temperature)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorState {
    pub last_reading: Option<SensorReading>,
    pub reading_interval_secs: u16,
    pub total_readings: u32,
    #[serde(default)]
    pub history: Vec<SensorReading>,
}

impl Default for SensorState {
    fn default() -> Self {
        Self {
            last_reading: None,
            reading_interval_secs: 30,
            total_readings: 0,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterState {
    pub active: bool,
    pub messages_forwarded: u32,
    pub messages_dropped: u32,
    pub hub_messages: u32,
    pub node_messages: u32,
    pub last_reset_at: u64,
}

impl Default for RepeaterState {
    fn default() -> Self {
        Self {
            active: true,
            messages_forwarded: 0,
            messages_dropped: 0,
            hub_messages: 0,
            node_messages: 0,
            last_reset_at: 0,
        }
    }
}

impl RepeaterState {
    /// Percentage of relayed frames that were forwarded (100 when idle).
    pub fn forwarding_success_rate(&self) -> f32 {
        let total = self.messages_forwarded + self.messages_dropped;
        if total == 0 {
            return 100.0;
        }
        self.messages_forwarded as f32 * 100.0 / total as f32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DoserState {
    pub dosing: bool,
    pub last_dose_ml: u16,
    pub total_dosed_ml: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterState {
    pub running: bool,
}

impl Default for FilterState {
    fn default() -> Self {
        Self { running: true }
    }
}

/// Closed set of device kinds, each carrying its hub-side state mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeviceKind {
    Light(LightState),
    Co2(Co2State),
    Heater(HeaterState),
    Feeder(FeederState),
    Sensor(SensorState),
    Repeater(RepeaterState),
    Doser(DoserState),
    Filter(FilterState),
}

impl DeviceKind {
    /// Fresh state for an announced node type; `None` for the hub and unknown types.
    pub fn for_node_type(node_type: NodeType) -> Option<Self> {
        Some(match node_type {
            NodeType::Light => DeviceKind::Light(LightState::default()),
            NodeType::Co2 => DeviceKind::Co2(Co2State::default()),
            NodeType::Heater => DeviceKind::Heater(HeaterState::default()),
            NodeType::FishFeeder => DeviceKind::Feeder(FeederState::default()),
            NodeType::Sensor => DeviceKind::Sensor(SensorState::default()),
            NodeType::Repeater => DeviceKind::Repeater(RepeaterState::default()),
            NodeType::Doser => DeviceKind::Doser(DoserState::default()),
            NodeType::Filter => DeviceKind::Filter(FilterState::default()),
            NodeType::Hub | NodeType::Unknown => return None,
        })
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            DeviceKind::Light(_) => NodeType::Light,
            DeviceKind::Co2(_) => NodeType::Co2,
            DeviceKind::Heater(_) => NodeType::Heater,
            DeviceKind::Feeder(_) => NodeType::FishFeeder,
            DeviceKind::Sensor(_) => NodeType::Sensor,
            DeviceKind::Repeater(_) => NodeType::Repeater,
            DeviceKind::Doser(_) => NodeType::Doser,
            DeviceKind::Filter(_) => NodeType::Filter,
        }
    }

    /// Devices whose loss of contact makes a tank unsafe.
    pub fn is_critical(&self) -> bool {
        matches!(self, DeviceKind::Heater(_) | DeviceKind::Co2(_))
    }

    /// Validate `cmd` against this kind and its safety limits and encode it.
    /// Does not change the mirror; see [`DeviceKind::apply`].
    pub fn encode(&self, cmd: &DeviceCommand, now: u64) -> Result<Vec<u8>, FleetError> {
        match (self, cmd) {
            (DeviceKind::Light(_), DeviceCommand::Light(c)) => encode_light(c),
            (DeviceKind::Co2(_), DeviceCommand::Co2(c)) => encode_co2(c),
            (DeviceKind::Heater(_), DeviceCommand::Heater(c)) => encode_heater(c),
            (DeviceKind::Feeder(s), DeviceCommand::Feeder(c)) => encode_feeder(s, c, now),
            (DeviceKind::Sensor(_), DeviceCommand::Sensor(c)) => encode_sensor(c),
            (DeviceKind::Repeater(_), DeviceCommand::Repeater(c)) => Ok(match c {
                RepeaterCommand::SetActive(on) => vec![repeater::SET_ACTIVE, u8::from(*on)],
                RepeaterCommand::ResetStats => vec![repeater::RESET_STATS],
                RepeaterCommand::RequestStats => vec![repeater::REQUEST_STATS],
            }),
            (DeviceKind::Doser(_), DeviceCommand::Doser(c)) => match c {
                DoserCommand::Dose { milliliters: 0 } => {
                    Err(FleetError::InvalidValue("dose must be at least 1 ml".into()))
                }
                DoserCommand::Dose { milliliters } => {
                    let [lo, hi] = milliliters.to_le_bytes();
                    Ok(vec![doser::DOSE, lo, hi])
                }
                DoserCommand::Stop => Ok(vec![doser::STOP]),
            },
            (DeviceKind::Filter(_), DeviceCommand::Filter(c)) => Ok(match c {
                FilterCommand::On => vec![filter::ON],
                FilterCommand::Off => vec![filter::OFF],
            }),
            (kind, _) => Err(FleetError::InvalidValue(format!(
                "command does not apply to a {} device",
                kind.node_type()
            ))),
        }
    }

    /// Update the mirror after `cmd` was handed to the radio.
    pub fn apply(&mut self, cmd: &DeviceCommand, now: u64) {
        match (self, cmd) {
            (DeviceKind::Light(s), DeviceCommand::Light(c)) => {
                match *c {
                    LightCommand::AllOff => s.channels = [0; 3],
                    LightCommand::AllOn => s.channels = [100; 3],
                    LightCommand::Channel { channel, on } => {
                        if let Some(slot) = s.channels.get_mut(usize::from(channel.saturating_sub(1))) {
                            *slot = if on { 100 } else { 0 };
                        }
                    }
                }
                s.enabled = s.channels.iter().any(|&c| c > 0);
            }
            (DeviceKind::Co2(s), DeviceCommand::Co2(c)) => match *c {
                Co2Command::Start { duration_secs } | Co2Command::Timed { duration_secs } => {
                    s.close(now);
                    s.state = if matches!(c, Co2Command::Timed { .. }) {
                        InjectionState::Timed
                    } else {
                        InjectionState::On
                    };
                    s.injection_started_at = now;
                    s.injection_duration_secs = duration_secs;
                    s.injection_count += 1;
                }
                Co2Command::Stop | Co2Command::EmergencyStop => s.close(now),
            },
            (DeviceKind::Heater(s), DeviceCommand::Heater(c)) => match *c {
                HeaterCommand::SetMode(mode) => {
                    s.mode = mode;
                    if mode == HeaterMode::Off {
                        s.heating = false;
                    }
                }
                HeaterCommand::SetTarget(t) => s.target_temperature = t,
                HeaterCommand::SetHysteresis(h) => s.hysteresis = h,
                HeaterCommand::ManualOn => {
                    s.mode = HeaterMode::Manual;
                    if !s.heating {
                        s.heating_cycles += 1;
                    }
                    s.heating = true;
                }
                HeaterCommand::ManualOff => {
                    s.mode = HeaterMode::Manual;
                    s.heating = false;
                }
                HeaterCommand::EnableAuto(t) => {
                    s.mode = HeaterMode::Auto;
                    s.target_temperature = t;
                }
            },
            (DeviceKind::Feeder(s), DeviceCommand::Feeder(c)) => match *c {
                FeederCommand::Feed { portions } => {
                    let portions = portions.clamp(1, MAX_FEED_PORTIONS);
                    s.state = FeederActivity::Feeding;
                    s.last_portions = portions;
                    s.last_feed_at = now;
                    s.total_feedings += 1;
                    s.total_portions += u32::from(portions);
                }
                FeederCommand::Test => s.state = FeederActivity::Feeding,
                FeederCommand::Cancel => s.state = FeederActivity::Idle,
            },
            (DeviceKind::Sensor(s), DeviceCommand::Sensor(SensorCommand::SetInterval { seconds })) => {
                s.reading_interval_secs = *seconds;
            }
            (DeviceKind::Repeater(s), DeviceCommand::Repeater(c)) => match *c {
                RepeaterCommand::SetActive(on) => s.active = on,
                RepeaterCommand::ResetStats => {
                    *s = RepeaterState {
                        active: s.active,
                        last_reset_at: now,
                        ..RepeaterState::default()
                    }
                }
                RepeaterCommand::RequestStats => {}
            },
            (DeviceKind::Doser(s), DeviceCommand::Doser(c)) => match *c {
                DoserCommand::Dose { milliliters } => {
                    s.dosing = true;
                    s.last_dose_ml = milliliters;
                    s.total_dosed_ml += u64::from(milliliters);
                }
                DoserCommand::Stop => s.dosing = false,
            },
            (DeviceKind::Filter(s), DeviceCommand::Filter(c)) => s.running = *c == FilterCommand::On,
            _ => {}
        }
    }

    /// Move the mirror to the safe state and return the command to push to
    /// the node, if the kind has one.
    pub fn fail_safe(&mut self, now: u64) -> Option<Vec<u8>> {
        match self {
            DeviceKind::Light(s) => {
                s.channels = [0; 3];
                s.enabled = false;
                Some(vec![light::ALL_OFF])
            }
            DeviceKind::Co2(s) => {
                s.close(now);
                Some(vec![co2::EMERGENCY_STOP])
            }
            DeviceKind::Heater(s) => {
                s.mode = HeaterMode::Off;
                s.heating = false;
                Some(vec![heater::MANUAL_OFF])
            }
            DeviceKind::Feeder(s) => {
                s.state = FeederActivity::Idle;
                Some(vec![feeder::CANCEL])
            }
            DeviceKind::Doser(s) => {
                s.dosing = false;
                Some(vec![doser::STOP])
            }
            DeviceKind::Sensor(_) | DeviceKind::Repeater(_) | DeviceKind::Filter(_) => None,
        }
    }

    /// Housekeeping that depends only on time (timed CO2 injections ending).
    pub fn tick(&mut self, now: u64) {
        if let DeviceKind::Co2(s) = self {
            if s.state == InjectionState::Timed
                && now.saturating_sub(s.injection_started_at) >= u64::from(s.injection_duration_secs) * 1000
            {
                s.close(now);
            }
        }
    }

    /// Fold an unsolicited report into the mirror. Returns a water reading for sensors.
    pub fn handle_report(&mut self, status: &Status, now: u64) -> Option<SensorReading> {
        let d = &status.data;
        match self {
            DeviceKind::Light(s) => {
                s.channels = [d[0].min(100), d[1].min(100), d[2].min(100)];
                s.enabled = d[3] != 0;
                None
            }
            DeviceKind::Co2(s) => {
                if d[0] == 0 && s.is_injecting() {
                    s.close(now);
                }
                None
            }
            DeviceKind::Heater(s) => {
                s.heating = d[0] != 0;
                s.current_temperature = Some(f32::from(d[1]) + f32::from(d[2]) / 100.0);
                None
            }
            DeviceKind::Feeder(s) => {
                s.state = match d[0] {
                    0 => FeederActivity::Idle,
                    1 => FeederActivity::Feeding,
                    _ => FeederActivity::Error,
                };
                None
            }
            DeviceKind::Sensor(s) => {
                let reading = SensorReading::from_status(d, now).filter(|r| r.is_plausible())?;
                s.last_reading = Some(reading);
                s.total_readings += 1;
                s.history.push(reading);
                if s.history.len() > SENSOR_HISTORY {
                    s.history.remove(0);
                }
                Some(reading)
            }
            DeviceKind::Repeater(s) => {
                let word = |i: usize| u32::from_le_bytes([d[i], d[i + 1], d[i + 2], d[i + 3]]);
                s.messages_forwarded = word(0);
                s.messages_dropped = word(4);
                s.hub_messages = word(8);
                s.node_messages = word(12);
                None
            }
            DeviceKind::Doser(s) => {
                s.dosing = d[0] != 0;
                None
            }
            DeviceKind::Filter(s) => {
                s.running = d[0] != 0;
                None
            }
        }
    }
}

fn encode_light(c: &LightCommand) -> Result<Vec<u8>, FleetError> {
    Ok(vec![match *c {
        LightCommand::AllOff => light::ALL_OFF,
        LightCommand::AllOn => light::ALL_ON,
        LightCommand::Channel { channel, on } => match (channel, on) {
            (1, false) => light::CH1_OFF,
            (1, true) => light::CH1_ON,
            (2, false) => light::CH2_OFF,
            (2, true) => light::CH2_ON,
            (3, false) => light::CH3_OFF,
            (3, true) => light::CH3_ON,
            _ => return Err(FleetError::InvalidValue(format!("light channel {} (expected 1-3)", channel))),
        },
    }])
}

fn encode_co2(c: &Co2Command) -> Result<Vec<u8>, FleetError> {
    let with_duration = |op: u8, secs: u16| {
        if secs == 0 {
            return Err(FleetError::InvalidValue("injection duration must be non-zero".into()));
        }
        if secs > MAX_CO2_INJECTION_SECS {
            return Err(FleetError::SafetyLimit(format!(
                "CO2 injection of {}s exceeds {}s",
                secs, MAX_CO2_INJECTION_SECS
            )));
        }
        let [lo, hi] = secs.to_le_bytes();
        Ok(vec![op, lo, hi])
    };
    match *c {
        Co2Command::Start { duration_secs } => with_duration(co2::START, duration_secs),
        Co2Command::Timed { duration_secs } => with_duration(co2::TIMED, duration_secs),
        Co2Command::Stop => Ok(vec![co2::STOP]),
        Co2Command::EmergencyStop => Ok(vec![co2::EMERGENCY_STOP]),
    }
}

fn check_target(t: f32) -> Result<(), FleetError> {
    if !(HEATER_MIN_TARGET..=HEATER_MAX_TARGET).contains(&t) {
        return Err(FleetError::SafetyLimit(format!(
            "heater target {:.1}°C outside {:.0}-{:.0}°C",
            t, HEATER_MIN_TARGET, HEATER_MAX_TARGET
        )));
    }
    Ok(())
}

fn with_f32(op: u8, v: f32) -> Vec<u8> {
    let mut out = vec![op];
    out.extend_from_slice(&v.to_le_bytes());
    out
}

fn encode_heater(c: &HeaterCommand) -> Result<Vec<u8>, FleetError> {
    match *c {
        HeaterCommand::SetMode(mode) => Ok(vec![heater::SET_MODE, mode.as_u8()]),
        HeaterCommand::SetTarget(t) => {
            check_target(t)?;
            Ok(with_f32(heater::SET_TARGET, t))
        }
        HeaterCommand::SetHysteresis(h) => {
            if !(0.1..=5.0).contains(&h) {
                return Err(FleetError::InvalidValue(format!("hysteresis {:.2} outside 0.1-5.0", h)));
            }
            Ok(with_f32(heater::SET_HYSTERESIS, h))
        }
        HeaterCommand::ManualOn => Ok(vec![heater::MANUAL_ON]),
        HeaterCommand::ManualOff => Ok(vec![heater::MANUAL_OFF]),
        HeaterCommand::EnableAuto(t) => {
            check_target(t)?;
            Ok(with_f32(heater::ENABLE_AUTO, t))
        }
    }
}

fn encode_feeder(s: &FeederState, c: &FeederCommand, now: u64) -> Result<Vec<u8>, FleetError> {
    match *c {
        FeederCommand::Feed { portions } => {
            if s.last_feed_at > 0 {
                let since = now.saturating_sub(s.last_feed_at) / 1000;
                if since < MIN_FEED_INTERVAL_SECS {
                    return Err(FleetError::SafetyLimit(format!(
                        "last feeding {}s ago (minimum interval {}s)",
                        since, MIN_FEED_INTERVAL_SECS
                    )));
                }
            }
            Ok(vec![feeder::FEED, portions.clamp(1, MAX_FEED_PORTIONS)])
        }
        FeederCommand::Test => Ok(vec![feeder::TEST]),
        FeederCommand::Cancel => Ok(vec![feeder::CANCEL]),
    }
}

fn encode_sensor(c: &SensorCommand) -> Result<Vec<u8>, FleetError> {
    match *c {
        SensorCommand::RequestReading => Ok(vec![sensor::REQUEST_READING]),
        SensorCommand::SetInterval { seconds: 0 } => {
            Err(FleetError::InvalidValue("reading interval must be non-zero".into()))
        }
        SensorCommand::SetInterval { seconds } => {
            let [lo, hi] = seconds.to_le_bytes();
            Ok(vec![sensor::SET_INTERVAL, lo, hi])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(data: &[u8]) -> Status {
        Status::new(0, 0, data)
    }

    #[test]
    fn every_kind_round_trips_node_type() {
        for t in [
            NodeType::Light,
            NodeType::Co2,
            NodeType::Heater,
            NodeType::FishFeeder,
            NodeType::Sensor,
            NodeType::Repeater,
            NodeType::Doser,
            NodeType::Filter,
        ] {
            assert_eq!(DeviceKind::for_node_type(t).unwrap().node_type(), t);
        }
        assert!(DeviceKind::for_node_type(NodeType::Hub).is_none());
    }

    #[test]
    fn fail_safe_commands_per_kind() {
        let mut co2 = DeviceKind::for_node_type(NodeType::Co2).unwrap();
        co2.apply(&DeviceCommand::Co2(Co2Command::Start { duration_secs: 60 }), 0);
        assert_eq!(co2.fail_safe(10_000), Some(vec![0xFF]));
        match &co2 {
            DeviceKind::Co2(s) => {
                assert!(!s.is_injecting());
                assert_eq!(s.total_injection_secs, 10);
            }
            _ => unreachable!(),
        }

        let mut heater = DeviceKind::for_node_type(NodeType::Heater).unwrap();
        assert_eq!(heater.fail_safe(0), Some(vec![heater::MANUAL_OFF]));
        let mut light = DeviceKind::for_node_type(NodeType::Light).unwrap();
        assert_eq!(light.fail_safe(0), Some(vec![light::ALL_OFF]));
        let mut sensor = DeviceKind::for_node_type(NodeType::Sensor).unwrap();
        assert_eq!(sensor.fail_safe(0), None);
        let mut filter = DeviceKind::for_node_type(NodeType::Filter).unwrap();
        assert_eq!(filter.fail_safe(0), None);
    }

    #[test]
    fn co2_duration_limit() {
        let co2 = DeviceKind::for_node_type(NodeType::Co2).unwrap();
        let err = co2
            .encode(&DeviceCommand::Co2(Co2Command::Timed { duration_secs: 3601 }), 0)
            .unwrap_err();
        assert!(matches!(err, FleetError::SafetyLimit(_)));
        assert_eq!(
            co2.encode(&DeviceCommand::Co2(Co2Command::Timed { duration_secs: 600 }), 0)
                .unwrap(),
            vec![0x03, 0x58, 0x02]
        );
    }

    #[test]
    fn timed_injection_expires_on_mirror() {
        let mut co2 = DeviceKind::for_node_type(NodeType::Co2).unwrap();
        co2.apply(&DeviceCommand::Co2(Co2Command::Timed { duration_secs: 5 }), 1_000);
        co2.tick(5_999);
        assert!(matches!(&co2, DeviceKind::Co2(s) if s.is_injecting()));
        co2.tick(6_000);
        assert!(matches!(&co2, DeviceKind::Co2(s) if !s.is_injecting() && s.total_injection_secs == 5));
    }

    #[test]
    fn heater_target_limits_and_encoding() {
        let heater = DeviceKind::for_node_type(NodeType::Heater).unwrap();
        assert!(heater
            .encode(&DeviceCommand::Heater(HeaterCommand::SetTarget(36.0)), 0)
            .is_err());
        let bytes = heater
            .encode(&DeviceCommand::Heater(HeaterCommand::SetTarget(26.5)), 0)
            .unwrap();
        assert_eq!(bytes[0], heater::SET_TARGET);
        assert_eq!(f32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]), 26.5);
    }

    #[test]
    fn feeder_interval_and_portion_clamp() {
        let mut feeder = DeviceKind::for_node_type(NodeType::FishFeeder).unwrap();
        let feed = DeviceCommand::Feeder(FeederCommand::Feed { portions: 9 });
        assert_eq!(feeder.encode(&feed, 1_000).unwrap(), vec![feeder::FEED, 5]);
        feeder.apply(&feed, 1_000);
        assert!(matches!(feeder.encode(&feed, 1_000 + 3_599_000), Err(FleetError::SafetyLimit(_))));
        assert!(feeder.encode(&feed, 1_000 + 3_600_000).is_ok());
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let light = DeviceKind::for_node_type(NodeType::Light).unwrap();
        assert!(matches!(
            light.encode(&DeviceCommand::Filter(FilterCommand::Off), 0),
            Err(FleetError::InvalidValue(_))
        ));
        assert!(light
            .encode(&DeviceCommand::Light(LightCommand::Channel { channel: 4, on: true }), 0)
            .is_err());
    }

    #[test]
    fn light_mirror_tracks_channels() {
        let mut light = DeviceKind::for_node_type(NodeType::Light).unwrap();
        light.apply(&DeviceCommand::Light(LightCommand::Channel { channel: 2, on: true }), 0);
        assert!(matches!(&light, DeviceKind::Light(s) if s.channels == [0, 100, 0] && s.enabled));
        light.handle_report(&report(&[10, 20, 30, 1]), 0);
        assert!(matches!(&light, DeviceKind::Light(s) if s.channels == [10, 20, 30]));
    }

    #[test]
    fn sensor_report_parses_reading() {
        let mut sensor = DeviceKind::for_node_type(NodeType::Sensor).unwrap();
        let reading = sensor
            .handle_report(&report(&[7, 25, 0x2C, 0x01, 24, 50]), 99)
            .unwrap();
        assert!((reading.ph - 7.25).abs() < 1e-4);
        assert_eq!(reading.tds, 300);
        assert!((reading.temperature - 24.5).abs() < 1e-4);
        assert_eq!(reading.timestamp, 99);
        // implausible pH is discarded
        assert!(sensor.handle_report(&report(&[20, 0, 0, 0, 24, 0]), 100).is_none());
    }

    #[test]
    fn repeater_counters() {
        let mut rep = DeviceKind::for_node_type(NodeType::Repeater).unwrap();
        let mut data = Vec::new();
        for v in [90u32, 10, 50, 40] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        rep.handle_report(&report(&data), 0);
        match &rep {
            DeviceKind::Repeater(s) => {
                assert_eq!(s.messages_forwarded, 90);
                assert_eq!(s.node_messages, 40);
                assert!((s.forwarding_success_rate() - 90.0).abs() < 1e-4);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn state_serializes_with_kind_tag() {
        let kind = DeviceKind::for_node_type(NodeType::Filter).unwrap();
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "filter");
        assert_eq!(json["running"], true);
        let back: DeviceKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }
}
