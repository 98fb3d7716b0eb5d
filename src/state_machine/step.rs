use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The fixed twelve-step workflow every job walks through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    JobCreated,
    DataProcessed,
    ExportGenerated,
    SessionLaunched,
    RegistrationStep,
    TermsAccepted,
    OtpSubmitted,
    ExtendedInfoFilled,
    DocumentUploaded,
    VerificationPageLoaded,
    StatusExtracted,
    JobCompleted,
}

impl Step {
    pub const ALL: [Step; 12] = [
        Step::JobCreated,
        Step::DataProcessed,
        Step::ExportGenerated,
        Step::SessionLaunched,
        Step::RegistrationStep,
        Step::TermsAccepted,
        Step::OtpSubmitted,
        Step::ExtendedInfoFilled,
        Step::DocumentUploaded,
        Step::VerificationPageLoaded,
        Step::StatusExtracted,
        Step::JobCompleted,
    ];

    pub fn first() -> Step {
        Step::JobCreated
    }

    /// 1-based position in the workflow.
    pub fn ordinal(self) -> u8 {
        Self::ALL
            .iter()
            .position(|s| *s == self)
            .map(|i| i as u8 + 1)
            .unwrap_or(0)
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Step> {
        ordinal
            .checked_sub(1)
            .and_then(|i| Self::ALL.get(i as usize).copied())
    }

    pub fn next(self) -> Option<Step> {
        Self::from_ordinal(self.ordinal() + 1)
    }

    /// Only the OTP step may park a job waiting for operator input.
    pub fn can_suspend(self) -> bool {
        self == Step::OtpSubmitted
    }

    /// The step whose result carries the verification outcome.
    pub fn yields_verification(self) -> bool {
        self == Step::StatusExtracted
    }

    pub fn label(self) -> &'static str {
        match self {
            Step::JobCreated => "Job Created",
            Step::DataProcessed => "Data Processed",
            Step::ExportGenerated => "Export Generated",
            Step::SessionLaunched => "Session Launched",
            Step::RegistrationStep => "Registration Step",
            Step::TermsAccepted => "Terms Accepted",
            Step::OtpSubmitted => "OTP Submitted",
            Step::ExtendedInfoFilled => "Extended Info Filled",
            Step::DocumentUploaded => "Document Uploaded",
            Step::VerificationPageLoaded => "Verification Page Loaded",
            Step::StatusExtracted => "Status Extracted",
            Step::JobCompleted => "Job Completed",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Step {
    type Err = String;

    /// Accepts the display label ("OTP Submitted") only; anything else is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|step| step.label() == s)
            .ok_or_else(|| format!("unknown step name: {s}"))
    }
}
