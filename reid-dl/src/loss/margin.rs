use crate::common::*;

/// The margin policy applied to the difference `d(a, p) - d(a, n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Margin {
    /// `ln(1 + exp(x))`, written as `soft`.
    Soft,
    /// The raw difference, written as `none`.
    Disabled,
    /// The hinge `max(0, x + m)`.
    Hard(R64),
}

impl Margin {
    pub fn apply(&self, diff: &Tensor) -> Tensor {
        match *self {
            Self::Soft => diff.softplus(),
            Self::Disabled => diff.shallow_clone(),
            Self::Hard(margin) => (diff + margin.raw()).clamp_min(0.0),
        }
    }
}

impl Default for Margin {
    fn default() -> Self {
        Self::Soft
    }
}

impl FromStr for Margin {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let margin = match text.trim() {
            "soft" => Self::Soft,
            "none" => Self::Disabled,
            text => {
                let value: f64 = text.parse().map_err(|_| {
                    format_err!(
                        "invalid margin '{}', expect 'soft', 'none' or a number",
                        text
                    )
                })?;
                ensure!(value.is_finite(), "the margin must be finite");
                Self::Hard(r64(value))
            }
        };
        Ok(margin)
    }
}

impl Display for Margin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Disabled => write!(f, "none"),
            Self::Hard(margin) => write!(f, "{}", margin),
        }
    }
}

impl Serialize for Margin {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Hard(margin) => serializer.serialize_f64(margin.raw()),
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Margin {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(MarginVisitor)
    }
}

struct MarginVisitor;

impl<'de> Visitor<'de> for MarginVisitor {
    type Value = Margin;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("'soft', 'none' or a number")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        value.parse().map_err(|err| E::custom(format!("{:?}", err)))
    }

    fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if !value.is_finite() {
            return Err(E::custom("the margin must be finite"));
        }
        Ok(Margin::Hard(r64(value)))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        self.visit_f64(value as f64)
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        self.visit_f64(value as f64)
    }
}
