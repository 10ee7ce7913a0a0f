//! Typed routes.
//!
//! A route is a name plus argument and reply types. Both sides of the relay use the
//! same route types, so a mismatch between what the display sends and what the host
//! expects is a compile error rather than a runtime surprise:
//!
//! ```rust,ignore
//! supervisor.serve_get::<Contrast, _, _>(|(channel,)| async move {
//!     Ok(live.contrast(channel).await)
//! })?;
//!
//! let limits = relay.get::<Contrast>((0,)).await?;
//! ```

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::experiment::state::AcquisitionStatus;
use crate::hardware::control::{Control, ValveEntry};
use crate::hardware::{Frame, StateValue, ValveKey, ValveState};
use crate::relay::supervisor::Supervisor;
use crate::relay::RelayError;

/// A named endpoint and its argument type.
pub trait Route {
    /// Name on the wire
    const NAME: &'static str;
    /// Positional arguments, usually a tuple
    type Args: Serialize + DeserializeOwned + Send + 'static;
}

/// A route answered with exactly one reply.
pub trait GetRoute: Route {
    /// Reply type
    type Reply: Serialize + DeserializeOwned + Send + 'static;
}

/// A fire-and-forget route. Handlers never send a reply.
pub trait PostRoute: Route {}

/// Raw arguments of one request.
#[derive(Debug, Clone, Default)]
pub struct Call {
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
}

/// What a handler sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Send this value
    Value(Value),
    /// Send nothing (post routes)
    Nothing,
}

pub(crate) type Handler =
    Arc<dyn Fn(Call) -> BoxFuture<'static, anyhow::Result<Reply>> + Send + Sync>;

macro_rules! get_route {
    ($(#[$doc:meta])* $ty:ident, $name:literal, $args:ty => $reply:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $ty;

        impl Route for $ty {
            const NAME: &'static str = $name;
            type Args = $args;
        }

        impl GetRoute for $ty {
            type Reply = $reply;
        }
    };
}

macro_rules! post_route {
    ($(#[$doc:meta])* $ty:ident, $name:literal, $args:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $ty;

        impl Route for $ty {
            const NAME: &'static str = $name;
            type Args = $args;
        }

        impl PostRoute for $ty {}
    };
}

get_route!(
    /// Latest live frame, `None` before the first capture.
    LiveImage, "img", () => Option<Frame>
);
get_route!(
    /// Current stage position.
    StagePosition, "xy", () => (f64, f64)
);
get_route!(
    /// Names of arrays declared so far in this run.
    DeclaredArrays, "arrays", () => Vec<String>
);
get_route!(
    /// Every valve of the valve bank.
    ValveStates, "valves", () => Vec<ValveEntry>
);
get_route!(
    /// State of every stateful device.
    DeviceStates, "states", () => Vec<(String, StateValue)>
);
get_route!(
    /// Auto-contrast limits of a channel, from its first frame.
    Contrast, "contrast", (usize,) => Option<(u16, u16)>
);
get_route!(
    /// Acquisition progress.
    RunStatus, "status", () => AcquisitionStatus
);

post_route!(
    /// Open or close one valve.
    SetValve, "set_valve", (ValveKey, ValveState)
);
post_route!(
    /// Set the state of a named device.
    SetDeviceState, "set_state", (String, StateValue)
);
post_route!(
    /// Pause, resume or cancel the acquisition.
    RunCommandRoute, "run_command", (RunCommand,)
);
post_route!(
    /// Operator-chosen top-left and bottom-right corners.
    SubmitBoundary, "boundaries", ((f64, f64), (f64, f64))
);
post_route!(
    /// Operator-chosen position list.
    SubmitPositions, "positions", (Vec<(f64, f64)>,)
);

/// Run-control commands the display may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCommand {
    /// Clear the running gate
    Pause,
    /// Set the running gate
    Resume,
    /// Stop the acquisition, keeping what was written
    Cancel,
}

/// Serve the control-surface routes: stage position, valves and device states.
pub fn register_control_routes(
    supervisor: &mut Supervisor,
    control: Arc<Control>,
) -> Result<(), RelayError> {
    let c = control.clone();
    supervisor.serve_get::<StagePosition, _, _>(move |()| {
        let c = c.clone();
        async move { c.xy().await }
    })?;

    let c = control.clone();
    supervisor.serve_get::<ValveStates, _, _>(move |()| {
        let c = c.clone();
        async move { c.valve_states().await }
    })?;

    let c = control.clone();
    supervisor.serve_post::<SetValve, _, _>(move |(key, state)| {
        let c = c.clone();
        async move {
            tracing::info!(valve = %key, %state, "Setting valve");
            c.set_valve(&key, state).await
        }
    })?;

    let c = control.clone();
    supervisor.serve_get::<DeviceStates, _, _>(move |()| {
        let c = c.clone();
        async move { c.device_states().await }
    })?;

    let c = control;
    supervisor.serve_post::<SetDeviceState, _, _>(move |(device, value)| {
        let c = c.clone();
        async move {
            tracing::info!(%device, %value, "Setting device state");
            c.set_state(&device, value).await
        }
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_names() {
        assert_eq!(LiveImage::NAME, "img");
        assert_eq!(StagePosition::NAME, "xy");
        assert_eq!(DeclaredArrays::NAME, "arrays");
        assert_eq!(SubmitBoundary::NAME, "boundaries");
    }

    #[test]
    fn test_run_command_wire_format() {
        assert_eq!(
            serde_json::to_value(RunCommand::Cancel).unwrap(),
            serde_json::json!("cancel")
        );
    }
}
