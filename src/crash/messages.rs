//! Messages emitted by the crash_serializer helper.

use prost::Message;

/// One chunk of crash data. A crash is announced by a `Crash` payload and
/// followed by any number of `Blob` and `Core` chunks with the same id.
#[derive(Clone, PartialEq, Message)]
pub struct FetchCrashesResponse {
    #[prost(int64, tag = "1")]
    pub crash_id: i64,
    #[prost(oneof = "CrashPayload", tags = "2, 3, 4")]
    pub payload: Option<CrashPayload>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum CrashPayload {
    #[prost(message, tag = "2")]
    Crash(CrashInfo),
    #[prost(message, tag = "3")]
    Blob(CrashBlob),
    #[prost(message, tag = "4")]
    Core(CoreDump),
}

#[derive(Clone, PartialEq, Message)]
pub struct CrashInfo {
    #[prost(string, tag = "1")]
    pub exec_name: String,
    #[prost(string, tag = "2")]
    pub prog: String,
    #[prost(string, tag = "3")]
    pub version: String,
    #[prost(string, tag = "4")]
    pub sig: String,
    #[prost(string, tag = "5")]
    pub in_progress_integration_test: String,
    #[prost(string, tag = "6")]
    pub collector: String,
    #[prost(message, repeated, tag = "7")]
    pub fields: Vec<CrashMetadata>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CrashMetadata {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub text: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CrashBlob {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub blob: Vec<u8>,
    #[prost(string, tag = "3")]
    pub filename: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CoreDump {
    #[prost(string, tag = "1")]
    pub filename: String,
    #[prost(bytes = "vec", tag = "2")]
    pub blob: Vec<u8>,
}

impl FetchCrashesResponse {
    /// Short human readable description, used for logging.
    pub fn summary(&self) -> String {
        match &self.payload {
            Some(CrashPayload::Crash(info)) => format!(
                "crash {}: {} ({}) sig={}",
                self.crash_id, info.exec_name, info.collector, info.sig
            ),
            Some(CrashPayload::Blob(blob)) => format!(
                "crash {}: blob {} {} bytes",
                self.crash_id,
                blob.filename,
                blob.blob.len()
            ),
            Some(CrashPayload::Core(core)) => format!(
                "crash {}: core {} {} bytes",
                self.crash_id,
                core.filename,
                core.blob.len()
            ),
            None => format!("crash {}: empty", self.crash_id),
        }
    }
}
