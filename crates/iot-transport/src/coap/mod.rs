//! Receive-only CoAP decoding and the CoIoT status listener.
//!
//! Devices broadcast non-confirmable CoAP frames on `224.0.1.187:5683`
//! carrying a JSON status payload and a vendor option identifying the
//! sender. [`CoapTransport`] turns each valid frame into a
//! [`Notification`](crate::transport::Notification) with method
//! `CoIoT.Status`. Malformed datagrams are logged and dropped.

mod codec;
mod listener;

pub use codec::{
    COIOT_OPTION_GLOBAL_DEVID, COIOT_OPTION_STATUS_SERIAL, COIOT_OPTION_STATUS_VALIDITY,
    CoapError, CoapMessage, CoapOption, CoiotDeviceId, MessageType, decode,
};
pub use listener::{
    COIOT_MULTICAST_GROUP, COIOT_PORT, COIOT_STATUS_METHOD, CoapConfig, CoapMode, CoapTransport,
    status_notification,
};
