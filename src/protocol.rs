//! Rendering of semantic commands into ASCII wire strings and parsing of
//! status lines back into events.
//!
//! Commands are rendered from a [`Profile`]; nothing here knows a concrete
//! dialect. Status lines come in two shapes:
//!
//! - `key=value` pairs, optionally several per line: `power=on,volume=45`
//! - compact forms: `pwr_on`, `vol42`, `vol_42`, or a bare source token `cd`

use crate::error::{Result, RotelError};
use crate::profile::{parse_number, Profile};
use crate::types::{Field, FieldValue, VolumeValue};

/// Semantic command sent to the amplifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch power on or off
    Power(bool),

    /// Mute or unmute
    Mute(bool),

    /// Set volume on the profile's raw scale
    SetVolume(VolumeValue),

    /// Select a logical source
    SetSource(String),

    /// Ask the device to push status changes unsolicited
    EnablePush,

    /// Stop unsolicited status pushes
    DisablePush,

    /// Query the current value of a field
    Query(Field),
}

impl Command {
    /// Action name under which the profile stores this command
    ///
    /// `SetVolume` and `SetSource` are rendered from the volume rule and
    /// source map instead and have no action entry.
    pub fn action(&self) -> Option<&'static str> {
        let action = match self {
            Command::Power(true) => "power_on",
            Command::Power(false) => "power_off",
            Command::Mute(true) => "mute_on",
            Command::Mute(false) => "mute_off",
            Command::EnablePush => "push_on",
            Command::DisablePush => "push_off",
            Command::Query(field) => match field {
                Field::Power => "power_query",
                Field::Volume => "volume_query",
                Field::Mute => "mute_query",
                Field::Source => "source_query",
                Field::Model => "model_query",
                Field::Version => "version_query",
            },
            Command::SetVolume(_) | Command::SetSource(_) => return None,
        };
        Some(action)
    }
}

/// Semantic event decoded from a status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Power(bool),
    Volume(VolumeValue),
    Mute(bool),
    Source(String),
    Model(String),
    Version(String),

    /// A recognized field carrying a value the profile cannot represent
    /// (out-of-range volume, unmapped source). Holds the offending text.
    Unknown(String),
}

impl Event {
    /// State value carried by this event, if any
    pub fn into_field_value(self) -> Option<FieldValue> {
        match self {
            Event::Power(on) => Some(FieldValue::Power(on)),
            Event::Volume(v) => Some(FieldValue::Volume(v)),
            Event::Mute(m) => Some(FieldValue::Mute(m)),
            Event::Source(s) => Some(FieldValue::Source(s)),
            Event::Model(m) => Some(FieldValue::Model(m)),
            Event::Version(v) => Some(FieldValue::Version(v)),
            Event::Unknown(_) => None,
        }
    }
}

/// Render a command to its wire string
///
/// Out-of-range volumes and unknown sources fail with
/// [`RotelError::InvalidArgument`]; values are never clamped.
pub fn encode(profile: &Profile, command: &Command) -> Result<String> {
    let wire = match command {
        Command::SetVolume(value) => {
            if !profile.volume.contains(u32::from(*value)) {
                return Err(RotelError::InvalidArgument(format!(
                    "volume {} outside {}..={}",
                    value, profile.volume.min, profile.volume.max
                )));
            }
            format!("{}{}", profile.volume.format(*value), profile.terminator)
        }
        Command::SetSource(name) => profile
            .source_token(name)
            .map(str::to_string)
            .ok_or_else(|| {
                RotelError::InvalidArgument(format!("source {name:?} not available in profile {}", profile.key))
            })?,
        other => {
            let action = other.action().unwrap_or_default();
            profile
                .command(action)
                .map(str::to_string)
                .ok_or_else(|| {
                    RotelError::InvalidArgument(format!("profile {} has no {action} command", profile.key))
                })?
        }
    };

    debug_assert!(!wire.contains(['\r', '\n']));
    Ok(wire)
}

/// Decode the first event carried by a status line
///
/// Returns `None` for lines no known shape matches.
pub fn decode(profile: &Profile, line: &str) -> Option<Event> {
    decode_all(profile, line).into_iter().next()
}

/// Decode every event carried by a status line, in order
pub fn decode_all(profile: &Profile, line: &str) -> Vec<Event> {
    let cleaned: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    let body = cleaned
        .trim_end_matches(crate::connection::STATUS_TERMINATOR as char)
        .trim_end_matches(profile.terminator);
    if body.is_empty() {
        return Vec::new();
    }

    if body.contains('=') {
        body.split(',')
            .filter_map(|part| part.split_once('='))
            .filter_map(|(key, value)| decode_pair(profile, &key.to_ascii_lowercase(), value))
            .collect()
    } else {
        decode_compact(profile, &body.to_ascii_lowercase())
            .into_iter()
            .collect()
    }
}

fn decode_pair(profile: &Profile, key: &str, value: &str) -> Option<Event> {
    let keys = &profile.status;
    let lower = value.to_ascii_lowercase();

    if has_key(&keys.power, key) {
        parse_switch(&lower).map(Event::Power)
    } else if has_key(&keys.volume, key) {
        decode_volume(profile, &lower)
    } else if has_key(&keys.mute, key) {
        parse_switch(&lower).map(Event::Mute)
    } else if has_key(&keys.source, key) {
        Some(decode_source(profile, &lower))
    } else if has_key(&keys.model, key) {
        (!value.is_empty()).then(|| Event::Model(value.to_string()))
    } else if has_key(&keys.version, key) {
        (!value.is_empty()).then(|| Event::Version(value.to_string()))
    } else {
        None
    }
}

fn decode_compact(profile: &Profile, body: &str) -> Option<Event> {
    let keys = &profile.status;

    if let Some(on) = strip_any(&keys.power, body).find_map(parse_switch) {
        return Some(Event::Power(on));
    }

    if let Some(value) = profile.volume.parse(body) {
        return Some(volume_event(profile, value, body));
    }
    if let Some(value) = strip_any(&keys.volume, body).find_map(parse_number) {
        return Some(volume_event(profile, value, body));
    }

    if let Some(muted) = strip_any(&keys.mute, body).find_map(parse_switch) {
        return Some(Event::Mute(muted));
    }

    if let Some(name) = profile.source_name(body) {
        return Some(Event::Source(name.to_string()));
    }
    strip_any(&keys.source, body)
        .find_map(|rest| profile.source_name(rest))
        .map(|name| Event::Source(name.to_string()))
}

fn decode_volume(profile: &Profile, value: &str) -> Option<Event> {
    parse_number(value).map(|v| volume_event(profile, v, value))
}

fn volume_event(profile: &Profile, value: u32, raw: &str) -> Event {
    match VolumeValue::try_from(value) {
        Ok(v) if profile.volume.contains(value) => Event::Volume(v),
        _ => {
            tracing::warn!(value, profile = %profile.key, "Volume outside profile range");
            Event::Unknown(format!("volume={raw}"))
        }
    }
}

fn decode_source(profile: &Profile, value: &str) -> Event {
    match profile.source_name(value) {
        Some(name) => Event::Source(name.to_string()),
        None => {
            tracing::warn!(source = value, profile = %profile.key, "Source not in profile");
            Event::Unknown(format!("source={value}"))
        }
    }
}

fn has_key(keys: &[String], key: &str) -> bool {
    keys.iter().any(|k| k == key)
}

/// Remainders of `body` after each matching key prefix, with one optional `_` dropped
fn strip_any<'a>(keys: &'a [String], body: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    keys.iter().filter_map(move |key| {
        body.strip_prefix(key.as_str())
            .map(|rest| rest.strip_prefix('_').unwrap_or(rest))
    })
}

fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" => Some(true),
        "off" | "standby" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::rotel_ascii_v1;

    #[test]
    fn encode_fixed_commands() {
        let profile = rotel_ascii_v1();
        assert_eq!(encode(&profile, &Command::Power(true)).unwrap(), "power_on!");
        assert_eq!(encode(&profile, &Command::Power(false)).unwrap(), "power_off!");
        assert_eq!(encode(&profile, &Command::Mute(true)).unwrap(), "mute_on!");
        assert_eq!(encode(&profile, &Command::EnablePush).unwrap(), "rs232_update_on!");
        assert_eq!(encode(&profile, &Command::Query(Field::Model)).unwrap(), "model?");
    }

    #[test]
    fn encode_volume_zero_padded() {
        let profile = rotel_ascii_v1();
        assert_eq!(encode(&profile, &Command::SetVolume(42)).unwrap(), "vol_42!");
        assert_eq!(encode(&profile, &Command::SetVolume(5)).unwrap(), "vol_05!");
        assert_eq!(encode(&profile, &Command::SetVolume(96)).unwrap(), "vol_96!");
    }

    #[test]
    fn encode_volume_out_of_range_fails() {
        let profile = rotel_ascii_v1();
        for v in [97, 100, 255] {
            let err = encode(&profile, &Command::SetVolume(v)).unwrap_err();
            assert!(matches!(err, RotelError::InvalidArgument(_)), "volume {v}");
        }

        let mut narrow = rotel_ascii_v1();
        narrow.volume.min = 10;
        assert!(encode(&narrow, &Command::SetVolume(9)).is_err());
        assert!(encode(&narrow, &Command::SetVolume(10)).is_ok());
    }

    #[test]
    fn volume_round_trips_over_whole_range() {
        let profile = rotel_ascii_v1();
        for v in profile.volume.min..=profile.volume.max {
            let wire = encode(&profile, &Command::SetVolume(v)).unwrap();
            assert_eq!(decode(&profile, &wire), Some(Event::Volume(v)), "wire {wire}");
        }
    }

    #[test]
    fn sources_round_trip() {
        let profile = rotel_ascii_v1();
        for name in profile.source_names() {
            let wire = encode(&profile, &Command::SetSource(name.to_string())).unwrap();
            assert_eq!(decode(&profile, &wire), Some(Event::Source(name.to_string())));
        }
    }

    #[test]
    fn unknown_source_fails() {
        let profile = rotel_ascii_v1();
        let err = encode(&profile, &Command::SetSource("hdmi".into())).unwrap_err();
        assert!(matches!(err, RotelError::InvalidArgument(_)));
    }

    #[test]
    fn encoded_commands_are_single_line() {
        let profile = rotel_ascii_v1();
        let commands = [
            Command::Power(true),
            Command::Mute(false),
            Command::SetVolume(12),
            Command::SetSource("phono".into()),
            Command::EnablePush,
            Command::DisablePush,
        ];
        for command in &commands {
            let wire = encode(&profile, command).unwrap();
            assert!(wire.ends_with('!'), "{wire}");
            assert!(!wire.contains(['\r', '\n']));
        }
    }

    #[test]
    fn decode_key_value_lines() {
        let profile = rotel_ascii_v1();
        assert_eq!(decode(&profile, "power=on"), Some(Event::Power(true)));
        assert_eq!(decode(&profile, "power=standby"), Some(Event::Power(false)));
        assert_eq!(decode(&profile, "volume=45"), Some(Event::Volume(45)));
        assert_eq!(decode(&profile, "mute=off"), Some(Event::Mute(false)));
        assert_eq!(decode(&profile, "source=CD"), Some(Event::Source("cd".into())));
        assert_eq!(decode(&profile, "model=A14"), Some(Event::Model("A14".into())));
        assert_eq!(decode(&profile, "version=1.2.3"), Some(Event::Version("1.2.3".into())));
    }

    #[test]
    fn decode_compact_lines() {
        let profile = rotel_ascii_v1();
        assert_eq!(decode(&profile, "pwr_on"), Some(Event::Power(true)));
        assert_eq!(decode(&profile, "power_off"), Some(Event::Power(false)));
        assert_eq!(decode(&profile, "vol42"), Some(Event::Volume(42)));
        assert_eq!(decode(&profile, "vol_07"), Some(Event::Volume(7)));
        assert_eq!(decode(&profile, "mute_on"), Some(Event::Mute(true)));
        assert_eq!(decode(&profile, "opt2"), Some(Event::Source("opt2".into())));
        assert_eq!(decode(&profile, "src_tuner"), Some(Event::Source("tuner".into())));
    }

    #[test]
    fn decode_tolerates_terminator_and_whitespace() {
        let profile = rotel_ascii_v1();
        assert_eq!(decode(&profile, " vol42$ "), Some(Event::Volume(42)));
        assert_eq!(decode(&profile, "power = on"), Some(Event::Power(true)));
    }

    #[test]
    fn decode_multi_field_line_in_order() {
        let profile = rotel_ascii_v1();
        let events = decode_all(&profile, "power=on,volume=30,mute=off,source=aux1");
        assert_eq!(
            events,
            vec![
                Event::Power(true),
                Event::Volume(30),
                Event::Mute(false),
                Event::Source("aux1".into()),
            ]
        );
    }

    #[test]
    fn out_of_range_volume_decodes_to_unknown() {
        let profile = rotel_ascii_v1();
        assert!(matches!(decode(&profile, "volume=120"), Some(Event::Unknown(_))));
        assert!(matches!(decode(&profile, "vol999"), Some(Event::Unknown(_))));
    }

    #[test]
    fn overflowing_volume_decodes_to_unknown() {
        let profile = rotel_ascii_v1();
        assert!(matches!(decode(&profile, "vol99999999999"), Some(Event::Unknown(_))));
        assert!(matches!(decode(&profile, "vol_99999999999"), Some(Event::Unknown(_))));
        assert!(matches!(decode(&profile, "volume=99999999999"), Some(Event::Unknown(_))));
    }

    #[test]
    fn unmapped_source_decodes_to_unknown() {
        let profile = rotel_ascii_v1();
        assert!(matches!(decode(&profile, "source=hdmi3"), Some(Event::Unknown(_))));
    }

    #[test]
    fn unrecognized_lines_decode_to_none() {
        let profile = rotel_ascii_v1();
        assert_eq!(decode(&profile, ""), None);
        assert_eq!(decode(&profile, "hello"), None);
        assert_eq!(decode(&profile, "freq=44.1"), None);
        assert_eq!(decode(&profile, "power=maybe"), None);
        assert_eq!(decode(&profile, "volume?"), None);
        assert_eq!(decode(&profile, "vol_up"), None);
    }

    #[test]
    fn unknown_event_has_no_field_value() {
        assert_eq!(Event::Unknown("volume=120".into()).into_field_value(), None);
        assert_eq!(Event::Mute(true).into_field_value(), Some(FieldValue::Mute(true)));
    }
}
