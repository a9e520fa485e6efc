use mrtd_zk::iso7816::apdu::{Apdu, Response, ResponseTrailer};
use mrtd_zk::iso7816::card::{CommunicationError, SmartCard};


/// One expected command and the chip's answer to it.
pub struct Step {
    pub header: u32,
    pub payload: &'static [u8],
    pub response: &'static [u8],
}


/// Answers a fixed sequence of commands in order.
///
/// A command that deviates from the script is answered with 0x6988 and ends the script.
pub struct ScriptedCard {
    steps: &'static [Step],
    position: usize,
}
impl ScriptedCard {
    pub const fn new(steps: &'static [Step]) -> Self {
        Self { steps, position: 0 }
    }

    pub fn finished(&self) -> bool {
        self.position == self.steps.len()
    }
}
impl SmartCard for ScriptedCard {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let Some(step) = self.steps.get(self.position) else {
            return Ok(Response::from_status(0x6988));
        };
        let payload_matches = request.data.request_data() == Some(step.payload)
            || (step.payload.is_empty() && request.data.request_data().is_none());
        if request.header.to_be_u32() != step.header || !payload_matches {
            self.position = self.steps.len() + 1;
            return Ok(Response::from_status(0x6988));
        }
        self.position += 1;
        Ok(Response::new(step.response.to_vec(), ResponseTrailer::SUCCESS))
    }
}
