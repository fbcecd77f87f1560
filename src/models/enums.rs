use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(FieldType {
    Text => "text",
    Number => "number",
    Date => "date",
    Email => "email",
    Phone => "phone",
    Currency => "currency",
    Address => "address",
    Identifier => "identifier",
    Boolean => "boolean",
    Url => "url",
    Other => "other",
});

impl FieldType {
    /// Lenient mapping for type names coming back from an analysis model.
    pub fn from_model_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "text" | "string" | "name" => Self::Text,
            "number" | "integer" | "int" | "float" | "decimal" | "numeric" => Self::Number,
            "date" | "datetime" | "date_time" => Self::Date,
            "email" | "e-mail" => Self::Email,
            "phone" | "telephone" | "phone_number" => Self::Phone,
            "currency" | "money" | "amount" => Self::Currency,
            "address" => Self::Address,
            "identifier" | "id" | "code" | "reference" => Self::Identifier,
            "boolean" | "bool" | "checkbox" => Self::Boolean,
            "url" | "uri" | "link" => Self::Url,
            _ => Self::Other,
        }
    }
}

str_enum!(FormatKind {
    Email => "email",
    Phone => "phone",
    Date => "date",
    Url => "url",
    Currency => "currency",
    PostalCode => "postal_code",
});

str_enum!(ConfidenceLevel {
    VeryHigh => "very_high",
    High => "high",
    Medium => "medium",
    Low => "low",
    VeryLow => "very_low",
});

impl ConfidenceLevel {
    /// Descending threshold ladder.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::VeryHigh
        } else if score >= 0.8 {
            Self::High
        } else if score >= 0.6 {
            Self::Medium
        } else if score >= 0.4 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }
}

str_enum!(ValidationStatus {
    Pending => "pending",
    Partial => "partial",
    Complete => "complete",
    Failed => "failed",
});

str_enum!(ReviewStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Reviewed => "reviewed",
    Approved => "approved",
});

impl ReviewStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Reviewed => 2,
            Self::Approved => 3,
        }
    }

    /// Review only moves forward; approval is terminal.
    pub fn can_transition_to(&self, next: ReviewStatus) -> bool {
        *self != Self::Approved && next.rank() > self.rank()
    }
}

str_enum!(ModifiedBy {
    Ai => "ai",
    User => "user",
});

str_enum!(DocumentKind {
    Pdf => "pdf",
    Image => "image",
    PlainText => "plain_text",
    Unknown => "unknown",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn level_ladder_boundaries() {
        assert_eq!(ConfidenceLevel::from_score(0.95), ConfidenceLevel::VeryHigh);
        assert_eq!(ConfidenceLevel::from_score(0.9), ConfidenceLevel::VeryHigh);
        assert_eq!(ConfidenceLevel::from_score(0.85), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.6), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.4), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(0.39), ConfidenceLevel::VeryLow);
    }

    #[test]
    fn enum_round_trips_through_str() {
        for status in [
            ReviewStatus::Pending,
            ReviewStatus::InProgress,
            ReviewStatus::Reviewed,
            ReviewStatus::Approved,
        ] {
            assert_eq!(ReviewStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_enum_value_is_rejected() {
        let err = FieldType::from_str("hologram").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { .. }));
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ConfidenceLevel::VeryHigh).unwrap();
        assert_eq!(json, "\"very_high\"");
    }

    #[test]
    fn model_labels_map_leniently() {
        assert_eq!(FieldType::from_model_label("Integer"), FieldType::Number);
        assert_eq!(FieldType::from_model_label(" e-mail "), FieldType::Email);
        assert_eq!(FieldType::from_model_label("unknown"), FieldType::Other);
    }

    #[test]
    fn review_status_moves_forward_only() {
        assert!(ReviewStatus::Pending.can_transition_to(ReviewStatus::InProgress));
        assert!(ReviewStatus::Pending.can_transition_to(ReviewStatus::Approved));
        assert!(!ReviewStatus::Reviewed.can_transition_to(ReviewStatus::InProgress));
        assert!(!ReviewStatus::Approved.can_transition_to(ReviewStatus::Approved));
    }
}
