use std::borrow::Cow;

use crate::model::{codec::CodecError, EnvelopeId, InvalidTransition};
use crate::protocol::{durable::DurableError, transport::TransportError};

#[derive(Debug)]
pub struct Error {
    pub context: Cow<'static, str>,
    pub kind: ErrorKind,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.context, self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::InvalidTransition(e) => Some(e),
            ErrorKind::StorageUnavailable(e) => Some(e),
            ErrorKind::Codec(e) => Some(e),
            ErrorKind::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    pub fn contextual<T: Into<ErrorKind>>(
        context: impl Into<Cow<'static, str>>,
    ) -> impl FnOnce(T) -> Self {
        move |kind| Self {
            context: context.into(),
            kind: kind.into(),
        }
    }
    pub fn new(context: impl Into<Cow<'static, str>>, kind: impl Into<ErrorKind>) -> Self {
        Self {
            context: context.into(),
            kind: kind.into(),
        }
    }
    pub fn runtime_stopped(context: impl Into<Cow<'static, str>>) -> Self {
        Self::new(context, ErrorKind::RuntimeStopped)
    }
    pub fn unknown_destination(destination: impl std::fmt::Display) -> Self {
        let destination = destination.to_string();
        Self::new(
            format!("resolve destination {destination}"),
            ErrorKind::UnknownDestination(destination),
        )
    }
    pub fn is_runtime_stopped(&self) -> bool {
        matches!(self.kind, ErrorKind::RuntimeStopped)
    }
}

macro_rules! error_kind {
    (
        pub enum $ErrorKind: ident {
            $($Kind: ident: $InnerType: ty),* $(,)?
        }
    ) => {
        $(
            impl From<$InnerType> for $ErrorKind {
                fn from(e: $InnerType) -> Self {
                    $ErrorKind::$Kind(e)
                }
            }
        )*
    };
}

#[derive(Debug)]
pub enum ErrorKind {
    InvalidTransition(InvalidTransition),
    StorageUnavailable(DurableError),
    Codec(CodecError),
    Transport(TransportError),
    DuplicateCorrelation(EnvelopeId),
    ReplyTimeout,
    ActivityTimeout,
    RuntimeStopped,
    UnknownDestination(String),
    Handler(String),
    InvalidState(String),
}

error_kind! {
    pub enum ErrorKind {
        InvalidTransition: InvalidTransition,
        StorageUnavailable: DurableError,
        Codec: CodecError,
        Transport: TransportError,
        DuplicateCorrelation: EnvelopeId,
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidTransition(e) => write!(f, "invalid transition: {e}"),
            ErrorKind::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
            ErrorKind::Codec(e) => write!(f, "{e}"),
            ErrorKind::Transport(e) => write!(f, "{e}"),
            ErrorKind::DuplicateCorrelation(id) => {
                write!(f, "a reply waiter for {id} already exists")
            }
            ErrorKind::ReplyTimeout => write!(f, "reply timeout"),
            ErrorKind::ActivityTimeout => write!(f, "tracked activity did not settle in time"),
            ErrorKind::RuntimeStopped => write!(f, "runtime stopped"),
            ErrorKind::UnknownDestination(d) => write!(f, "unknown destination {d}"),
            ErrorKind::Handler(e) => write!(f, "handler failed: {e}"),
            ErrorKind::InvalidState(e) => write!(f, "invalid state: {e}"),
        }
    }
}
