//! A session with one chip: transport, negotiated secure channel and authentication state.


use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::bac;
use crate::iso7816::apdu::{Apdu, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::file::{read_file, ReadError};
use crate::lds::FileId;
use crate::mrz::DocumentCredentials;
use crate::pace;
use crate::secure_messaging::SecureChannel;
use crate::security_info::{parse_security_infos, PaceInfo, SecurityInfo};


/// The application identifier of the eMRTD application (Doc 9303 Part 10 § 3.6.2).
pub const EMRTD_APPLICATION_ID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChannelState {
    #[default] Idle,
    ChannelEstablishing,
    ChannelEstablished,
    Failed,
}

/// What to do when the chip announces PACE but the handshake fails.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PacePolicy {
    /// Log the failure and run BAC on the same transport.
    #[default] FallBackToBac,

    /// Report the failure.
    Fail,
}

/// The protocol that established the current channel.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChannelProtocol {
    Bac,
    Pace,
}


#[derive(Debug)]
pub enum Error {
    Bac(bac::Error),
    Pace(pace::Error),
    SelectApplication(Response),
    Communication(CommunicationError),
    /// EF.CardAccess exists or could not be told apart from a missing file, but reading it failed.
    CardAccess(ReadError),
    NotIdle { state: ChannelState },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bac(e)
                => write!(f, "BAC failed: {}", e),
            Self::Pace(e)
                => write!(f, "PACE failed: {}", e),
            Self::SelectApplication(response)
                => write!(f, "selecting the eMRTD application failed with response code 0x{:04X}", response.trailer.to_word()),
            Self::Communication(e)
                => write!(f, "communication failed: {}", e),
            Self::CardAccess(e)
                => write!(f, "reading EF.CardAccess failed: {}", e),
            Self::NotIdle { state }
                => write!(f, "cannot negotiate a channel in state {:?}", state),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bac(e) => Some(e),
            Self::Pace(e) => Some(e),
            Self::SelectApplication(_) => None,
            Self::Communication(e) => Some(e),
            Self::CardAccess(e) => Some(e),
            Self::NotIdle { .. } => None,
        }
    }
}
impl From<bac::Error> for Error {
    fn from(value: bac::Error) -> Self { Self::Bac(value) }
}
impl From<pace::Error> for Error {
    fn from(value: pace::Error) -> Self { Self::Pace(value) }
}
impl From<CommunicationError> for Error {
    fn from(value: CommunicationError) -> Self { Self::Communication(value) }
}


/// A session with one chip.
///
/// Before a channel is established, APDUs pass through unchanged; afterwards, every APDU sent
/// through the session is protected with Secure Messaging. Session keys are zeroized when the
/// session is dropped.
pub struct ChipSession<SC: SmartCard> {
    card: SC,
    channel: Option<SecureChannel>,
    channel_state: ChannelState,
    channel_protocol: Option<ChannelProtocol>,
    chip_auth_succeeded: bool,
}
impl<SC: SmartCard> ChipSession<SC> {
    pub fn new(card: SC) -> Self {
        Self {
            card,
            channel: None,
            channel_state: ChannelState::Idle,
            channel_protocol: None,
            chip_auth_succeeded: false,
        }
    }

    pub fn channel_state(&self) -> ChannelState { self.channel_state }
    pub fn channel_protocol(&self) -> Option<ChannelProtocol> { self.channel_protocol }
    pub fn channel(&self) -> Option<&SecureChannel> { self.channel.as_ref() }
    pub fn chip_auth_succeeded(&self) -> bool { self.chip_auth_succeeded }

    /// Replaces the session keys after a successful Chip Authentication.
    pub(crate) fn rekey(&mut self, channel: SecureChannel) {
        self.channel = Some(channel);
        self.chip_auth_succeeded = true;
    }

    /// Gives the transport back, dropping the session keys.
    pub fn into_card(self) -> SC {
        self.card
    }

    /// Reads EF.CardAccess without Secure Messaging and returns the first PACE info whose protocol
    /// we recognize.
    ///
    /// Only a missing file means that PACE is not offered; any other read failure, a timeout
    /// included, is an error. Undecodable contents are logged and treated as no PACE.
    #[instrument(skip(self))]
    fn read_pace_info(&mut self, chunk_size: u8) -> Result<Option<PaceInfo>, Error> {
        let card_access = match read_file(&mut self.card, FileId::CardAccess, chunk_size) {
            Ok(ca) => ca,
            Err(ReadError::FileNotFound) => {
                debug!("no EF.CardAccess; PACE is not offered");
                return Ok(None);
            },
            Err(e) => {
                warn!("failed to read EF.CardAccess: {}", e);
                return Err(Error::CardAccess(e));
            },
        };
        let infos = match parse_security_infos(&card_access) {
            Ok(i) => i,
            Err(e) => {
                warn!("failed to decode EF.CardAccess: {}", e);
                return Ok(None);
            },
        };
        Ok(infos.into_iter()
            .filter_map(|info| match info {
                SecurityInfo::Pace(pace_info) => Some(pace_info),
                _ => None,
            })
            .find(|pace_info| pace_info.pace_protocol().is_some()))
    }

    fn select_application(&mut self) -> Result<(), Error> {
        let select = Apdu::new(
            0x00,
            0xA4, // SELECT
            0x04, // by DF name
            0x0C, // no response data
            Data::RequestDataShort { request_data: EMRTD_APPLICATION_ID.to_vec() },
        );
        let response = self.communicate(&select)?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::SelectApplication(response))
        }
    }

    /// Establishes a BAC channel after selecting the eMRTD application.
    pub fn establish_bac(&mut self, mrz_key: &[u8]) -> Result<(), Error> {
        self.select_application()?;
        let channel = bac::establish(&mut self.card, mrz_key)?;
        self.channel = Some(channel);
        self.channel_protocol = Some(ChannelProtocol::Bac);
        Ok(())
    }

    /// Establishes a PACE channel, then selects the eMRTD application through it.
    pub fn establish_pace(&mut self, pace_info: &PaceInfo, mrz_key: &[u8]) -> Result<(), Error> {
        let channel = pace::establish(&mut self.card, pace_info, mrz_key)?;
        self.channel = Some(channel);
        self.channel_protocol = Some(ChannelProtocol::Pace);
        self.select_application()
    }

    /// Negotiates a secure channel: PACE if EF.CardAccess offers it, BAC otherwise.
    ///
    /// The session must be idle. On failure, the session moves to [`ChannelState::Failed`] and
    /// stays there.
    #[instrument(skip_all)]
    pub fn negotiate(
        &mut self,
        credentials: &DocumentCredentials,
        pace_policy: PacePolicy,
        chunk_size: u8,
    ) -> Result<ChannelProtocol, Error> {
        if self.channel_state != ChannelState::Idle {
            return Err(Error::NotIdle { state: self.channel_state });
        }
        self.channel_state = ChannelState::ChannelEstablishing;
        match self.negotiate_inner(credentials, pace_policy, chunk_size) {
            Ok(protocol) => {
                info!("secure channel established using {:?}", protocol);
                self.channel_state = ChannelState::ChannelEstablished;
                Ok(protocol)
            },
            Err(e) => {
                self.channel = None;
                self.channel_protocol = None;
                self.channel_state = ChannelState::Failed;
                Err(e)
            },
        }
    }

    fn negotiate_inner(
        &mut self,
        credentials: &DocumentCredentials,
        pace_policy: PacePolicy,
        chunk_size: u8,
    ) -> Result<ChannelProtocol, Error> {
        let mrz_key = credentials.mrz_key();

        if let Some(pace_info) = self.read_pace_info(chunk_size)? {
            match self.establish_pace(&pace_info, mrz_key.as_bytes()) {
                Ok(()) => return Ok(ChannelProtocol::Pace),
                Err(e) => {
                    self.channel = None;
                    self.channel_protocol = None;
                    if pace_policy == PacePolicy::Fail || is_disconnect(&e) {
                        return Err(e);
                    }
                    warn!("PACE failed, falling back to BAC: {}", e);
                },
            }
        }

        self.establish_bac(mrz_key.as_bytes())?;
        Ok(ChannelProtocol::Bac)
    }
}
impl<SC: SmartCard> SmartCard for ChipSession<SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let result = match self.channel.as_mut() {
            Some(channel) => channel.communicate(&mut self.card, request),
            None => self.card.communicate(request),
        };
        if let Err(CommunicationError::Disconnected) = result {
            self.channel = None;
            self.channel_state = ChannelState::Failed;
        }
        result
    }
}
impl<SC: SmartCard> fmt::Debug for ChipSession<SC> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChipSession")
            .field("channel_state", &self.channel_state)
            .field("channel_protocol", &self.channel_protocol)
            .field("chip_auth_succeeded", &self.chip_auth_succeeded)
            .finish_non_exhaustive()
    }
}


fn is_disconnect(error: &Error) -> bool {
    matches!(
        error,
        Error::Communication(CommunicationError::Disconnected)
            | Error::Pace(pace::Error::Communication(CommunicationError::Disconnected))
            | Error::Bac(bac::Error::Communication(CommunicationError::Disconnected))
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso7816::apdu::ResponseTrailer;

    /// Has no EF.CardAccess and refuses BAC.
    struct NoPaceCard {
        seen: Vec<u32>,
    }
    impl SmartCard for NoPaceCard {
        fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
            let header = request.header.to_be_u32();
            self.seen.push(header);
            match header {
                0x00_A4_02_0C => Ok(Response::from_status(0x6A82)),
                0x00_A4_04_0C if request.data.request_data() == Some(&EMRTD_APPLICATION_ID[..]) => {
                    Ok(Response::new(Vec::new(), ResponseTrailer::SUCCESS))
                },
                _ => Ok(Response::from_status(0x6982)),
            }
        }
    }

    /// Times out on every exchange but answers BAC's GET CHALLENGE.
    struct StallingCard {
        seen: Vec<u32>,
    }
    impl SmartCard for StallingCard {
        fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
            let header = request.header.to_be_u32();
            self.seen.push(header);
            match header {
                0x00_84_00_00 => Ok(Response::new(vec![0x55; 8], ResponseTrailer::SUCCESS)),
                0x00_A4_04_0C => Ok(Response::new(Vec::new(), ResponseTrailer::SUCCESS)),
                _ => Err(CommunicationError::Timeout { elapsed: std::time::Duration::from_secs(5) }),
            }
        }
    }

    struct UnpluggedCard;
    impl SmartCard for UnpluggedCard {
        fn communicate(&mut self, _request: &Apdu) -> Result<Response, CommunicationError> {
            Err(CommunicationError::Disconnected)
        }
    }

    fn credentials() -> DocumentCredentials {
        DocumentCredentials::new("L898902C", "690806", "940623").unwrap()
    }

    #[test]
    fn without_card_access_bac_is_attempted() {
        let mut session = ChipSession::new(NoPaceCard { seen: Vec::new() });
        let result = session.negotiate(&credentials(), PacePolicy::default(), 0xDF);
        assert!(matches!(result, Err(Error::Bac(bac::Error::OperationFailed { operation: bac::Operation::GetChallenge, .. }))));
        assert_eq!(session.channel_state(), ChannelState::Failed);
        assert!(session.channel().is_none());
        let card = session.into_card();
        assert_eq!(card.seen, vec![0x00_A4_02_0C, 0x00_A4_04_0C, 0x00_84_00_00]);
    }

    #[test]
    fn failed_session_is_not_renegotiated() {
        let mut session = ChipSession::new(UnpluggedCard);
        assert!(session.negotiate(&credentials(), PacePolicy::Fail, 0xDF).is_err());
        assert_eq!(session.channel_state(), ChannelState::Failed);
        assert!(matches!(
            session.negotiate(&credentials(), PacePolicy::Fail, 0xDF),
            Err(Error::NotIdle { state: ChannelState::Failed }),
        ));
    }

    #[test]
    fn card_access_timeout_is_not_a_missing_file() {
        let mut session = ChipSession::new(StallingCard { seen: Vec::new() });
        let result = session.negotiate(&credentials(), PacePolicy::FallBackToBac, 0xDF);
        assert!(matches!(
            result,
            Err(Error::CardAccess(ReadError::SelectCommunication(CommunicationError::Timeout { .. }))),
        ));
        assert_eq!(session.channel_state(), ChannelState::Failed);
        // BAC was not attempted
        assert_eq!(session.into_card().seen, vec![0x00_A4_02_0C]);
    }
}
