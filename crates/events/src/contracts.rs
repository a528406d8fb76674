//! Well-known routing keys, queues and the bindings between them.

/// Routing keys envelopes are published under.
pub mod routing_keys {
    pub const TRIP_EVENT_CREATED: &str = "trip.event.created";
    pub const TRIP_EVENT_DRIVER_ASSIGNED: &str = "trip.event.driver_assigned";
    pub const TRIP_EVENT_NO_DRIVERS_FOUND: &str = "trip.event.no_drivers_found";
    pub const TRIP_EVENT_DRIVER_NOT_INTERESTED: &str = "trip.event.driver_not_interested";

    pub const DRIVER_CMD_TRIP_REQUEST: &str = "driver.cmd.trip_request";
    pub const DRIVER_CMD_TRIP_ACCEPT: &str = "driver.cmd.trip_accept";
    pub const DRIVER_CMD_TRIP_DECLINE: &str = "driver.cmd.trip_decline";
    pub const DRIVER_CMD_LOCATION: &str = "driver.cmd.location";
    /// Sent to a driver's connection once it is registered.
    pub const DRIVER_CMD_REGISTER: &str = "driver.cmd.register";

    pub const PAYMENT_EVENT_SESSION_CREATED: &str = "payment.event.session_created";
    pub const PAYMENT_EVENT_SUCCESS: &str = "payment.event.success";
}

/// Queue names.
pub mod queues {
    pub const FIND_AVAILABLE_DRIVERS: &str = "find_available_drivers";
    pub const DRIVER_CMD_TRIP_REQUEST: &str = "driver_cmd_trip_request";
    pub const DRIVER_TRIP_RESPONSE: &str = "driver_trip_response";
    pub const NOTIFY_DRIVER_NO_DRIVERS_FOUND: &str = "notify_driver_no_drivers_found";
    pub const NOTIFY_DRIVER_ASSIGN: &str = "notify_driver_assign";
    pub const NOTIFY_PAYMENT_SESSION_CREATED: &str = "notify_payment_session_created";
    pub const NOTIFY_PAYMENT_SUCCESS: &str = "notify_payment_success";
    pub const PAYMENT_SUCCESS: &str = "payment_success";
}

/// A queue and the routing keys bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: &'static str,
    pub routing_keys: &'static [&'static str],
}

use routing_keys as rk;

/// Static bus topology shared by every bus implementation.
pub const TOPOLOGY: &[QueueBinding] = &[
    QueueBinding {
        queue: queues::FIND_AVAILABLE_DRIVERS,
        routing_keys: &[rk::TRIP_EVENT_CREATED, rk::TRIP_EVENT_DRIVER_NOT_INTERESTED],
    },
    QueueBinding {
        queue: queues::DRIVER_CMD_TRIP_REQUEST,
        routing_keys: &[rk::DRIVER_CMD_TRIP_REQUEST],
    },
    QueueBinding {
        queue: queues::DRIVER_TRIP_RESPONSE,
        routing_keys: &[rk::DRIVER_CMD_TRIP_ACCEPT, rk::DRIVER_CMD_TRIP_DECLINE],
    },
    QueueBinding {
        queue: queues::NOTIFY_DRIVER_NO_DRIVERS_FOUND,
        routing_keys: &[rk::TRIP_EVENT_NO_DRIVERS_FOUND],
    },
    QueueBinding {
        queue: queues::NOTIFY_DRIVER_ASSIGN,
        routing_keys: &[rk::TRIP_EVENT_DRIVER_ASSIGNED],
    },
    QueueBinding {
        queue: queues::NOTIFY_PAYMENT_SESSION_CREATED,
        routing_keys: &[rk::PAYMENT_EVENT_SESSION_CREATED],
    },
    QueueBinding {
        queue: queues::NOTIFY_PAYMENT_SUCCESS,
        routing_keys: &[rk::PAYMENT_EVENT_SUCCESS],
    },
    QueueBinding {
        queue: queues::PAYMENT_SUCCESS,
        routing_keys: &[rk::PAYMENT_EVENT_SUCCESS],
    },
];

/// Bindings of `queue`, if it is part of the topology.
pub fn binding(queue: &str) -> Option<&'static QueueBinding> {
    TOPOLOGY.iter().find(|b| b.queue == queue)
}

/// Queues receiving a copy of envelopes published under `routing_key`.
pub fn queues_bound_to(routing_key: &str) -> impl Iterator<Item = &'static str> + '_ {
    TOPOLOGY
        .iter()
        .filter(move |b| b.routing_keys.contains(&routing_key))
        .map(|b| b.queue)
}
