use anyhow::{bail, Result};
use ecrlink::{LinkTiming, SerialSettings};
use serde::Deserialize;

/// The configuration of one terminal hookup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TerminalConfig {
    /// Serial device of the terminal, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,

    #[serde(default)]
    pub serial: SerialSettings,

    #[serde(default)]
    pub timing: LinkTiming,

    /// The transaction currency as defined by ISO 4217. See
    /// https://en.wikipedia.org/wiki/ISO_4217.
    ///
    /// The input is the alphabetic code, e.g. `EUR` or `SEK`; the wire
    /// carries the numeric code.
    #[serde(default = "currency")]
    #[serde(deserialize_with = "deserialize_iso_4217")]
    pub currency: String,

    /// Number of this register, carried in every transaction request.
    #[serde(default = "ecr_number")]
    pub ecr_number: u16,

    /// Delay before bonus-card mode is switched off after a bonus-only
    /// abort.
    #[serde(default = "bonus_disable_delay_ms")]
    pub bonus_disable_delay_ms: u64,
}

/// Deserializer which consumes an alphabetic code and returns the numeric
/// code.
fn deserialize_iso_4217<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let code = String::deserialize(deserializer)?;
    iso_4217(&code).map_err(serde::de::Error::custom)
}

/// The default currency (returns the EUR code).
fn currency() -> String {
    "978".to_string()
}

const fn ecr_number() -> u16 {
    1
}

const fn bonus_disable_delay_ms() -> u64 {
    500
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            serial: SerialSettings::default(),
            timing: LinkTiming::default(),
            currency: currency(),
            ecr_number: ecr_number(),
            bonus_disable_delay_ms: bonus_disable_delay_ms(),
        }
    }
}

/// Maps the currency code (three letters) to its numeric form.
///
/// The mapping is defined under ISO 4217. See
/// https://en.wikipedia.org/wiki/ISO_4217
fn iso_4217(code: &str) -> Result<String> {
    let numeric = match code.to_uppercase().as_str() {
        // Keep the list sorted by the numeric value.
        "DKK" => "208",
        "NOK" => "578",
        "SEK" => "752",
        "GBP" => "826",
        "USD" => "840",
        "EUR" => "978",
        "PLN" => "985",
        _ => bail!("Unknown currency code {code}"),
    };
    Ok(numeric.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_config() {
        // Valid inputs.
        let minimal =
            serde_json::from_str::<TerminalConfig>("{\"port\": \"/dev/ttyUSB0\"}").unwrap();
        assert_eq!(minimal.port, "/dev/ttyUSB0");
        assert_eq!(minimal.currency, "978");
        assert_eq!(minimal.ecr_number, 1);
        assert_eq!(minimal.serial.baud_rate, 19200);
        assert_eq!(minimal.timing.send_timeout_ms, 3000);
        assert_eq!(minimal.timing.send_retries, 3);
        assert_eq!(minimal.bonus_disable_delay_ms, 500);

        let with_all = serde_json::from_str::<TerminalConfig>(
            "{\"port\": \"COM3\", \"currency\": \"SEK\", \"ecr_number\": 7, \
             \"serial\": {\"baud_rate\": 9600}, \"timing\": {\"send_retries\": 1}}",
        )
        .unwrap();
        assert_eq!(with_all.currency, "752");
        assert_eq!(with_all.ecr_number, 7);
        assert_eq!(with_all.serial.baud_rate, 9600);
        assert_eq!(with_all.timing.send_retries, 1);

        // Invalid inputs.
        assert!(serde_json::from_str::<TerminalConfig>("{}").is_err());
        assert!(serde_json::from_str::<TerminalConfig>(
            "{\"port\": \"COM3\", \"currency\": \"ABC\"}"
        )
        .is_err());
        assert!(serde_json::from_str::<TerminalConfig>(
            "{\"port\": \"COM3\", \"currency\": 978}"
        )
        .is_err());
    }
}
