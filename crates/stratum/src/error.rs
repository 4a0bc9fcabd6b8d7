use super::*;

pub type Result<T, E = InternalError> = std::result::Result<T, E>;

/// Errors raised while parsing or constructing stratum wire types, independent of any
/// particular connection or session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum InternalError {
    #[snafu(display("{reason}"))]
    InvalidValue { reason: String },

    #[snafu(display("{message}"))]
    Parse { message: String },

    #[snafu(display("invalid hex digits for {input}: {source}"))]
    ParseHexInt {
        input: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("invalid hex: {source}"), context(false))]
    Hex { source: hex::FromHexError },

    #[snafu(display("username has no address component"))]
    EmptyUsername,

    #[snafu(display("invalid address: {source}"))]
    InvalidAddress {
        source: bitcoin::address::ParseError,
    },

    #[snafu(display("address {address} does not belong to network {expected:?}"))]
    NetworkMismatch { expected: Network, address: String },

    #[snafu(display("could not infer network from address"))]
    UnknownNetwork,
}

/// The error object carried on a stratum JSON-RPC response, per the upstream pool
/// protocol's `[code, message, traceback]` convention.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StratumErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub traceback: Option<Value>,
}

impl StratumErrorResponse {
    pub fn new(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: Value) -> Self {
        self.traceback = Some(traceback);
        self
    }
}

impl Serialize for StratumErrorResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.error_code)?;
        seq.serialize_element(&self.message)?;
        seq.serialize_element(&self.traceback)?;
        seq.end()
    }
}

impl fmt::Display for StratumErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_code, self.message)?;
        if let Some(traceback) = &self.traceback {
            write!(f, " ({traceback})")?;
        }
        Ok(())
    }
}

/// Errors a connection actor produces while handling a single client request. Every
/// variant carries the JSON-RPC error code the upstream protocol assigns to it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StratumError {
    #[snafu(display("unknown method {method}"))]
    UnknownMethod { method: String },

    #[snafu(display("method not allowed in current session state"))]
    MethodNotAllowed,

    #[snafu(display("unauthorized worker"))]
    Unauthorized,

    #[snafu(display("job not found"))]
    Stale,

    #[snafu(display("duplicate share"))]
    Duplicate,

    #[snafu(display("low difficulty share"))]
    AboveTarget,

    #[snafu(display("incorrect size of extranonce2"))]
    InvalidNonce2Length,

    #[snafu(display("ntime out of range"))]
    NtimeInvalid,

    #[snafu(display("no version mask negotiated"))]
    InvalidVersionMask,

    #[snafu(display("unsupported extension"))]
    UnsupportedExtension,

    #[snafu(display("no extranonce1 available"))]
    PoolFull,

    #[snafu(display("{source}"))]
    Internal { source: InternalError },

    #[snafu(display("{message}"))]
    Other { message: String },
}

impl StratumError {
    /// Matches the upstream pool protocol's numeric error codes so existing miner
    /// firmware that special-cases them keeps behaving the same way.
    pub fn code(&self) -> i32 {
        match self {
            StratumError::UnknownMethod { .. } => 20,
            StratumError::MethodNotAllowed => 25,
            StratumError::Unauthorized => 24,
            StratumError::Stale => 21,
            StratumError::Duplicate => 22,
            StratumError::AboveTarget => 23,
            StratumError::InvalidNonce2Length => 26,
            StratumError::NtimeInvalid => 27,
            StratumError::InvalidVersionMask => 28,
            StratumError::UnsupportedExtension => 29,
            StratumError::PoolFull => 30,
            StratumError::Internal { .. } => -1,
            StratumError::Other { .. } => -2,
        }
    }
}

impl From<&StratumError> for StratumErrorResponse {
    fn from(error: &StratumError) -> Self {
        StratumErrorResponse::new(error.code(), error.to_string())
    }
}

impl From<StratumError> for StratumErrorResponse {
    fn from(error: StratumError) -> Self {
        StratumErrorResponse::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_serializes_as_triple() {
        let response = StratumErrorResponse::new(21, "Job not found");
        let v = serde_json::to_value(&response).unwrap();
        assert_eq!(v, serde_json::json!([21, "Job not found", null]));
    }

    #[test]
    fn stratum_error_maps_to_matching_code() {
        let response: StratumErrorResponse = StratumError::Stale.into();
        assert_eq!(response.error_code, 21);
    }
}
