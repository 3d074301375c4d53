use crate::server::message::ClientMessage;
use crate::server::message::MessageError;

/// Validates the type-specific fields of a client message.
///
/// # Arguments
///
/// * `msg` - A reference to the `ClientMessage` that needs validation.
///
/// # Returns
///
/// * `Ok(())` if the message can be routed.
/// * `Err(MessageError::MissingDeviceId)` if a login carries no device id, or only whitespace.
pub fn validate_message(msg: &ClientMessage) -> Result<(), MessageError> {
    match msg {
        ClientMessage::Login { device_id } => match device_id {
            Some(id) if !id.trim().is_empty() => Ok(()),
            _ => Err(MessageError::MissingDeviceId),
        },
        _ => Ok(()),
    }
}
