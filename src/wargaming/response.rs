use serde::Deserialize;

#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum Response<T> {
    Data { data: T },
    Error { error: Error },
}

#[derive(Deserialize, Debug)]
pub struct Error {
    #[serde(default)]
    pub code: i32,

    #[serde(default)]
    pub message: Message,
}

#[derive(Deserialize, Debug, PartialEq, Default)]
pub enum Message {
    #[serde(rename = "REQUEST_LIMIT_EXCEEDED")]
    RequestLimitExceeded,

    #[serde(rename = "SOURCE_NOT_AVAILABLE")]
    SourceNotAvailable,

    #[serde(rename = "APPLICATION_IS_BLOCKED")]
    ApplicationIsBlocked,

    #[serde(rename = "INVALID_APPLICATION_ID")]
    InvalidApplicationId,

    #[serde(rename = "INVALID_IP_ADDRESS")]
    InvalidIpAddress,

    #[serde(rename = "ACCOUNT_ID_LIST_LIMIT_EXCEEDED")]
    AccountIdListLimitExceeded,

    #[default]
    #[serde(other)]
    Other,
}

impl Message {
    /// Whether a retry may succeed without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RequestLimitExceeded | Self::SourceNotAvailable)
    }
}
