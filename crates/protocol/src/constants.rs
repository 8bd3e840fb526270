use std::time::Duration;

/// Port the hub's local WebSocket API listens on.
pub const HUB_PORT: u16 = 17000;

/// `id` carried by every unsolicited broadcast from the hub.
pub const UI_BROADCAST_ID: &str = "ui_broadcast";

/// Substring of the login error returned when the session is already
/// authenticated. Any other login error is fatal for the attempt.
pub const ALREADY_LOGGED_IN: &str = "already logged in";

/// Time the hub may stay silent (no heartbeat ping) before the
/// connection is considered dead.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll period of the reconnect loop after a connection was lost.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// How long a scene may run before `hub.scenes.run` is considered stuck.
pub const SCENE_RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period added to the hub-announced mode switch delay.
pub const MODE_SWITCH_GRACE: Duration = Duration::from_secs(1);

/// Maximum inbound frame size accepted from the hub (16 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// JSON-RPC methods understood by the hub.
pub mod method {
    pub const LOGIN: &str = "hub.offline.login.ui";
    pub const INFO: &str = "hub.info.get";
    pub const DATA_LIST: &str = "hub.data.list";
    pub const DEVICES_LIST: &str = "hub.devices.list";
    pub const ITEMS_LIST: &str = "hub.items.list";
    pub const ITEM_VALUE_SET: &str = "hub.item.value.set";
    pub const SCENES_LIST: &str = "hub.scenes.list";
    pub const SCENES_RUN: &str = "hub.scenes.run";
    pub const ROOMS_LIST: &str = "hub.room.list";
    pub const MODES_GET: &str = "hub.modes.get";
    pub const MODES_CURRENT_GET: &str = "hub.modes.current.get";
    pub const MODES_SWITCH: &str = "hub.modes.switch";
    pub const NETWORK_GET: &str = "hub.network.get";
}

/// `msg_subclass` values of broadcasts the client reacts to.
pub mod subclass {
    pub const SCENE_RUN_PROGRESS: &str = "hub.scene.run.progress";
    pub const MODES_SWITCHED: &str = "hub.modes.switched";
    pub const ITEM_UPDATED: &str = "hub.item.updated";
    pub const DEVICE_UPDATED: &str = "hub.device.updated";
}

/// Terminal `status` values inside completion broadcasts.
pub mod status {
    pub const SCENE_FINISHED: &str = "finished";
    pub const MODE_SWITCH_DONE: &str = "done";
}
