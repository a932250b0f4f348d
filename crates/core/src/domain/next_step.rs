use serde::{Deserialize, Serialize};

/// Follow-up actions the assistant can recognise in a buyer's message or
/// propose after answering. "No known next step" is `Option::None` at use sites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextStepTag {
    TestDrive,
    SaveCustomerInfo,
    UpdateCrm,
}

impl NextStepTag {
    pub const ALL: [NextStepTag; 3] = [Self::TestDrive, Self::SaveCustomerInfo, Self::UpdateCrm];

    /// Wire names in `ALL` order, as the model is asked to emit them.
    pub const WIRE_NAMES: [&'static str; 3] =
        [Self::ALL[0].as_str(), Self::ALL[1].as_str(), Self::ALL[2].as_str()];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TestDrive => "TEST_DRIVE",
            Self::SaveCustomerInfo => "SAVE_CUSTOMER_INFO",
            Self::UpdateCrm => "UPDATE_CRM",
        }
    }
}
