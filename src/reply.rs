use crate::error::HerdNsError;
use crate::ResourceRecord;
use crate::{Header, Question};
use packed_struct::prelude::*;
use tracing::debug;

#[derive(Debug)]
pub struct Reply {
    pub header: Header,
    pub question: Option<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Reply {
    /// Turns this reply into the bytes to send back to the client. Needs
    /// `&mut self` because the section counts are written into the header
    /// as part of encoding.
    pub fn as_bytes(&mut self) -> Result<Vec<u8>, HerdNsError> {
        let mut retval: Vec<u8> = vec![];

        self.header.ancount = self.answers.len() as u16;
        self.header.nscount = self.authorities.len() as u16;
        self.header.arcount = self.additional.len() as u16;

        let reply_header = self.header.clone().pack()?;
        retval.extend(reply_header);

        let question_name = self.question.as_ref().map(|q| q.qname.clone());
        if let Some(question) = &self.question {
            retval.extend(question.to_bytes());
        }

        for answer in &self.answers {
            retval.extend(answer.as_bytes(question_name.as_deref()));
        }
        for authority in &self.authorities {
            debug!(?authority, "encoding authority record");
            retval.extend(authority.as_bytes(question_name.as_deref()));
        }
        for additional in &self.additional {
            debug!(?additional, "encoding additional record");
            retval.extend(additional.as_bytes(question_name.as_deref()));
        }

        Ok(retval)
    }

    /// Sets the truncated flag and drops everything but the header and
    /// question, for use when a UDP reply would exceed [crate::UDP_BUFFER_SIZE].
    pub fn set_truncated(self) -> Self {
        let mut header = self.header;
        header.truncated = true;
        Self {
            header,
            answers: vec![],
            authorities: vec![],
            additional: vec![],
            ..self
        }
    }
}
