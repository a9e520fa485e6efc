use std::fmt;
use std::time::Duration;

use crate::iso7816::apdu;
use crate::secure_messaging;


#[derive(Debug)]
pub enum CommunicationError {
    Write(apdu::WriteError),
    Transport(Box<dyn std::error::Error + Send + Sync>),
    ShortResponse,
    Timeout { elapsed: Duration },
    Disconnected,
    SecureMessaging(secure_messaging::Error),
}
impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(e) => write!(f, "APDU write error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::ShortResponse => write!(f, "response too short"),
            Self::Timeout { elapsed } => write!(f, "card did not respond in time ({} ms)", elapsed.as_millis()),
            Self::Disconnected => write!(f, "card has been removed"),
            Self::SecureMessaging(e) => write!(f, "Secure Messaging error: {}", e),
        }
    }
}
impl std::error::Error for CommunicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Write(e) => Some(e),
            Self::Transport(e) => Some(e.as_ref()),
            Self::ShortResponse => None,
            Self::Timeout { .. } => None,
            Self::Disconnected => None,
            Self::SecureMessaging(e) => Some(e),
        }
    }
}
impl From<apdu::WriteError> for CommunicationError {
    fn from(value: apdu::WriteError) -> Self { Self::Write(value) }
}
impl From<secure_messaging::Error> for CommunicationError {
    fn from(value: secure_messaging::Error) -> Self { Self::SecureMessaging(value) }
}


/// A smart card compatible with ISO/IEC 7816.
pub trait SmartCard {
    /// Send a request APDU to the smart card and receive a response APDU.
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError>;
}
impl<SC: SmartCard + ?Sized> SmartCard for &mut SC {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}
impl<SC: SmartCard + ?Sized> SmartCard for Box<SC> {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}


#[cfg(feature = "pcsc")]
impl From<pcsc::Error> for CommunicationError {
    fn from(value: pcsc::Error) -> Self {
        match value {
            pcsc::Error::RemovedCard|pcsc::Error::ResetCard|pcsc::Error::NoSmartcard
                => Self::Disconnected,
            other => Self::Transport(Box::new(other)),
        }
    }
}

#[cfg(feature = "pcsc")]
impl SmartCard for pcsc::Card {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        use tracing::debug;

        let out_buf = request.to_bytes()?;
        debug!("sending to card:\n{}", crate::hexdump(&out_buf));
        let mut in_buf = vec![0u8; request.data.response_data_length().unwrap_or(0) + 2];
        let in_slice = self.transmit(&out_buf, &mut in_buf)?;
        debug!("received from card:\n{}", crate::hexdump(in_slice));
        apdu::Response::from_slice(in_slice)
            .ok_or(CommunicationError::ShortResponse)
    }
}
