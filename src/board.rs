use std::convert::TryFrom;
use std::fmt;
use std::fs;
use thiserror::Error;

/// Symbolic, board-specific name of a GPIO line (e.g. `BCM21` or `GPIO6_IO14`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PinName(String);

impl PinName {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PinName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PinName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PinName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("unknown device model {0:?}")]
    UnrecognizedDevice(String),
    #[error("no device model configured and {path} is unreadable")]
    ModelUnavailable {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Developer boards with a known button/LED wiring.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DeviceModel {
    Rpi3,
    Imx7dPico,
}

impl TryFrom<&str> for DeviceModel {
    type Error = BoardError;

    fn try_from(model: &str) -> Result<Self, Self::Error> {
        // Device tree model strings carry trailing NULs and revision suffixes.
        let model = model.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        match model {
            "rpi3" => Ok(DeviceModel::Rpi3),
            "imx7d_pico" => Ok(DeviceModel::Imx7dPico),
            m if m.starts_with("Raspberry Pi 3") => Ok(DeviceModel::Rpi3),
            m if m.contains("i.MX7D") && m.to_ascii_uppercase().contains("PICO") => {
                Ok(DeviceModel::Imx7dPico)
            }
            other => Err(BoardError::UnrecognizedDevice(other.to_owned())),
        }
    }
}

/// Pins the button and the LED are connected to on a given board.
///
/// The defaults line up with the "A" button and red LED of the Rainbow HAT, but the HAT itself is not needed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BoardDefaults {
    pub button: PinName,
    pub led: PinName,
}

impl BoardDefaults {
    pub const MODEL_ENV: &'static str = "GPIO_LIFECYCLE_DEVICE";
    const DEVICE_TREE_MODEL: &'static str = "/proc/device-tree/model";

    pub fn for_device(model: DeviceModel) -> Self {
        use DeviceModel::*;

        let (button, led) = match model {
            Rpi3 => ("BCM21", "BCM6"),
            Imx7dPico => ("GPIO6_IO14", "GPIO2_IO02"),
        };

        Self {
            button: button.into(),
            led: led.into(),
        }
    }

    /// Looks up the pin names for a model string. Unknown models are an error, never a silent default.
    pub fn for_model(model: &str) -> Result<Self, BoardError> {
        DeviceModel::try_from(model).map(Self::for_device)
    }

    /// Resolves the running board from `GPIO_LIFECYCLE_DEVICE`, falling back to the device tree.
    pub fn detect() -> Result<Self, BoardError> {
        if let Ok(model) = std::env::var(Self::MODEL_ENV) {
            log::debug!("board model {:?} taken from {}", model, Self::MODEL_ENV);
            return Self::for_model(&model);
        }

        let model = fs::read_to_string(Self::DEVICE_TREE_MODEL).map_err(|source| {
            BoardError::ModelUnavailable {
                path: Self::DEVICE_TREE_MODEL,
                source,
            }
        })?;
        Self::for_model(&model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_map_to_pins() {
        let rpi = BoardDefaults::for_model("rpi3").unwrap();
        assert_eq!(rpi.button, PinName::from("BCM21"));
        assert_eq!(rpi.led, PinName::from("BCM6"));

        let pico = BoardDefaults::for_model("imx7d_pico").unwrap();
        assert_eq!(pico.button.as_str(), "GPIO6_IO14");
        assert_eq!(pico.led.as_str(), "GPIO2_IO02");
    }

    #[test]
    fn device_tree_strings_are_recognized() {
        assert_eq!(
            DeviceModel::try_from("Raspberry Pi 3 Model B Rev 1.2\0").unwrap(),
            DeviceModel::Rpi3
        );
        assert_eq!(
            DeviceModel::try_from("TechNexion PICO-IMX7D i.MX7D Pico\0").unwrap(),
            DeviceModel::Imx7dPico
        );
    }

    #[test]
    fn unknown_model_is_reported() {
        match BoardDefaults::for_model("odroid-c2") {
            Err(BoardError::UnrecognizedDevice(model)) => assert_eq!(model, "odroid-c2"),
            other => panic!("expected UnrecognizedDevice, got {:?}", other),
        }
    }
}
