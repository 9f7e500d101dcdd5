use std::{borrow::Cow, fmt, str};

/// Parsed graph reference. A graph reference is a string of the form `graph@variant`, the
/// variant defaulting to [`GraphRef::DEFAULT_VARIANT`] when omitted.
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct GraphRef {
    graph_id: String,
    variant: String,
}

impl GraphRef {
    pub const ARG_DESCRIPTION: &'static str = r#"Graph reference following the format "graph@variant""#;

    /// The variant used when a reference does not name one.
    pub const DEFAULT_VARIANT: &'static str = "current";

    /// Maximum length of both the graph id and the variant.
    pub const MAX_PART_LENGTH: usize = 64;

    /// Builds a reference from its parts, validating both.
    pub fn new(graph_id: &str, variant: Option<&str>) -> Result<Self, Cow<'static, str>> {
        validate_graph_id(graph_id)?;

        let variant = match variant {
            Some(variant) => {
                validate_variant(variant)?;
                variant
            }
            None => Self::DEFAULT_VARIANT,
        };

        Ok(GraphRef {
            graph_id: graph_id.to_owned(),
            variant: variant.to_owned(),
        })
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }
}

/// Graph ids start with a letter, followed by letters, digits, `_` or `-`.
pub fn validate_graph_id(graph_id: &str) -> Result<(), Cow<'static, str>> {
    let mut chars = graph_id.chars();

    let Some(first) = chars.next() else {
        return Err(Cow::Borrowed("The graph id is missing."));
    };

    // Checked first, so the messages below never echo an oversized value.
    if graph_id.len() > GraphRef::MAX_PART_LENGTH {
        let max = GraphRef::MAX_PART_LENGTH;
        return Err(Cow::Owned(format!("The graph id must be at most {max} characters long.")));
    }

    if !first.is_ascii_alphabetic() {
        return Err(Cow::Owned(format!("The graph id \"{graph_id}\" must start with a letter.")));
    }

    if let Some(invalid) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(Cow::Owned(format!("The graph id \"{graph_id}\" contains the invalid character '{invalid}'.")));
    }

    Ok(())
}

/// Variants are letters, digits and `_`, `-`, `.`, `:`, `/`, and must not start with a
/// separator.
pub fn validate_variant(variant: &str) -> Result<(), Cow<'static, str>> {
    let Some(first) = variant.chars().next() else {
        return Err(Cow::Borrowed("The variant is missing."));
    };

    if variant.len() > GraphRef::MAX_PART_LENGTH {
        let max = GraphRef::MAX_PART_LENGTH;
        return Err(Cow::Owned(format!("The variant must be at most {max} characters long.")));
    }

    if !first.is_ascii_alphanumeric() {
        return Err(Cow::Owned(format!("The variant \"{variant}\" must start with a letter or a digit.")));
    }

    let is_allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/');

    if let Some(invalid) = variant.chars().find(|c| !is_allowed(*c)) {
        return Err(Cow::Owned(format!("The variant \"{variant}\" contains the invalid character '{invalid}'.")));
    }

    Ok(())
}

impl str::FromStr for GraphRef {
    type Err = Cow<'static, str>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((_, "")) => Err(Cow::Borrowed("The variant after '@' is missing.")),
            Some((graph_id, variant)) => GraphRef::new(graph_id, Some(variant)),
            None => GraphRef::new(s, None),
        }
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.graph_id)?;
        f.write_str("@")?;
        f.write_str(&self.variant)
    }
}
