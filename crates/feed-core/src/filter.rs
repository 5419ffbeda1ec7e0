use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::item::FeedItem;

/// Client-side filter applied on top of the fetched feed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilterTag {
    #[default]
    All,
    Free,
    Farmer,
    Discounted,
    Category(String),
}

impl FilterTag {
    pub fn matches(&self, item: &FeedItem) -> bool {
        match self {
            Self::All => true,
            Self::Free => item.is_free(),
            Self::Farmer => item.is_farmer,
            Self::Discounted => item.is_discounted(),
            Self::Category(id) => item.category_id == *id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown filter tag: {0}")]
pub struct UnknownFilterTag(String);

impl FromStr for FilterTag {
    type Err = UnknownFilterTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "free" => Ok(Self::Free),
            "farmer" => Ok(Self::Farmer),
            "discounted" => Ok(Self::Discounted),
            other => match other.strip_prefix("category:") {
                Some(id) if !id.is_empty() => Ok(Self::Category(id.to_string())),
                _ => Err(UnknownFilterTag(other.to_string())),
            },
        }
    }
}

impl fmt::Display for FilterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Free => f.write_str("free"),
            Self::Farmer => f.write_str("farmer"),
            Self::Discounted => f.write_str("discounted"),
            Self::Category(id) => write!(f, "category:{id}"),
        }
    }
}

impl TryFrom<String> for FilterTag {
    type Error = UnknownFilterTag;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilterTag> for String {
    fn from(tag: FilterTag) -> Self {
        tag.to_string()
    }
}
