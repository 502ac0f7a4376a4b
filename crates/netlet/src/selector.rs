//! The device selector: a CEL expression supplied by the operator, compiled
//! once at startup and evaluated against every discovered device. The
//! expression sees a single `device` variable with the attribute map, e.g.
//! `device.attributes["netlet.dev/ifName"] == "eth1"`.

use cel_interpreter::{Context, Program, Value};
use thiserror::Error;
use tracing::warn;

use crate::device::{DeviceAttribute, NetworkDevice};

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid selector expression: {0}")]
    Compile(String),
}

pub struct DeviceSelector {
    expression: String,
    program: Program,
}

impl DeviceSelector {
    pub fn compile(expression: &str) -> Result<DeviceSelector, SelectorError> {
        let program =
            Program::compile(expression).map_err(|err| SelectorError::Compile(err.to_string()))?;
        Ok(DeviceSelector {
            expression: expression.to_string(),
            program,
        })
    }

    /// Whether the device passes the filter. Evaluation errors and
    /// non-boolean results reject the device with a warning, they never fail
    /// discovery.
    pub fn matches(&self, device: &NetworkDevice) -> bool {
        let mut context = Context::default();
        context.add_variable_from_value("device", device_value(device));

        match self.program.execute(&context) {
            Ok(Value::Bool(matched)) => matched,
            Ok(other) => {
                warn!(
                    device = %device.name,
                    expression = %self.expression,
                    "selector returned non-boolean value {other:?}, rejecting device"
                );
                false
            }
            Err(err) => {
                warn!(
                    device = %device.name,
                    expression = %self.expression,
                    error = %err,
                    "selector evaluation failed, rejecting device"
                );
                false
            }
        }
    }
}

fn device_value(device: &NetworkDevice) -> Value {
    let attributes: std::collections::HashMap<String, Value> = device
        .attributes
        .iter()
        .map(|(name, attribute)| {
            let value = match attribute {
                DeviceAttribute::String(s) | DeviceAttribute::Version(s) => {
                    Value::from(s.clone())
                }
                DeviceAttribute::Int(i) => Value::from(*i),
                DeviceAttribute::Bool(b) => Value::from(*b),
            };
            (name.clone(), value)
        })
        .collect();

    let mut device_map = std::collections::HashMap::new();
    device_map.insert("name".to_string(), Value::from(device.name.clone()));
    device_map.insert("attributes".to_string(), Value::from(attributes));
    Value::from(device_map)
}

/// Applies the selector to a snapshot. `None` keeps every device.
pub fn filter_devices(
    selector: Option<&DeviceSelector>,
    devices: Vec<NetworkDevice>,
) -> Vec<NetworkDevice> {
    match selector {
        None => devices,
        Some(selector) => devices
            .into_iter()
            .filter(|device| selector.matches(device))
            .collect(),
    }
}
