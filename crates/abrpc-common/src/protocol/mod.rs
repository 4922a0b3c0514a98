pub mod error;
pub mod requests;
pub mod responses;

#[cfg(test)]
mod tests;

pub use error::{AbrpcError, Result};
pub use requests::{
    generate_request_id, InterfaceName, MessageKind, MethodName, Request, RequestId, RpcValue,
    HEARTBEAT_ID_PREFIX,
};
pub use responses::{status, Response, StatusClass};

/// A decoded protocol message.
///
/// Which variant a frame decodes into depends on the role of the stream
/// owner: clients read responses, servers read requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::Request(req) => &req.id,
            Message::Response(resp) => &resp.id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(req) => req.kind,
            Message::Response(resp) => resp.kind,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind() == MessageKind::Heartbeat
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}
