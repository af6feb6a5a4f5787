// Copyright 2025 Rheostat Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Typed, hierarchical resource paths such as `sys0.cpu1.pe3` or
//! `sys0.mem0`. A segment without an index (`sys0.cpu0.pe`) is a wildcard
//! when the path is used as a pattern. Paths share their segment storage,
//! so clones are cheap and equality is segment-wise.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    System,
    Group,
    Cpu,
    Gpu,
    Accelerator,
    Memory,
    NetworkIf,
    ProcessingElement,
}

impl ResourceType {
    fn token(&self) -> &'static str {
        match self {
            Self::System => "sys",
            Self::Group => "grp",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Accelerator => "acc",
            Self::Memory => "mem",
            Self::NetworkIf => "net",
            Self::ProcessingElement => "pe",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "sys" => Some(Self::System),
            "grp" => Some(Self::Group),
            "cpu" => Some(Self::Cpu),
            "gpu" => Some(Self::Gpu),
            "acc" => Some(Self::Accelerator),
            "mem" => Some(Self::Memory),
            "net" => Some(Self::NetworkIf),
            "pe" => Some(Self::ProcessingElement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    pub kind: ResourceType,
    /// `None` makes this segment match any index when the path is used as
    /// a pattern.
    pub index: Option<u16>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PathParseError {
    #[error("empty resource path")]
    Empty,
    #[error("unknown resource type in segment {0:?}")]
    UnknownType(String),
    #[error("invalid index in segment {0:?}")]
    InvalidIndex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourcePath {
    segments: Arc<[PathSegment]>,
}

impl ResourcePath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self {
            segments: segments.into(),
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn leaf_type(&self) -> Option<ResourceType> {
        self.segments.last().map(|segment| segment.kind)
    }

    /// Index of the first segment of the given type, if present and
    /// concrete.
    pub fn index_of(&self, kind: ResourceType) -> Option<u16> {
        self.segments
            .iter()
            .find(|segment| segment.kind == kind)
            .and_then(|segment| segment.index)
    }

    pub fn system_id(&self) -> Option<u16> {
        self.index_of(ResourceType::System)
    }

    /// A concrete path names exactly one resource; a path with any
    /// wildcard segment is a pattern.
    pub fn is_concrete(&self) -> bool {
        self.segments.iter().all(|segment| segment.index.is_some())
    }

    /// Pattern matching: the pattern must have the same length and segment
    /// types; a pattern segment without an index matches any index.
    pub fn matches(&self, pattern: &ResourcePath) -> bool {
        if self.segments.len() != pattern.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(pattern.segments.iter())
            .all(|(own, wanted)| {
                own.kind == wanted.kind && (wanted.index.is_none() || wanted.index == own.index)
            })
    }

    /// Convenience constructor for a processing-element leaf.
    pub fn processing_element(sys: u16, cpu: u16, pe: u16) -> Self {
        Self::new(vec![
            PathSegment {
                kind: ResourceType::System,
                index: Some(sys),
            },
            PathSegment {
                kind: ResourceType::Cpu,
                index: Some(cpu),
            },
            PathSegment {
                kind: ResourceType::ProcessingElement,
                index: Some(pe),
            },
        ])
    }

    /// Convenience constructor for a memory-node leaf.
    pub fn memory_node(sys: u16, node: u16) -> Self {
        Self::new(vec![
            PathSegment {
                kind: ResourceType::System,
                index: Some(sys),
            },
            PathSegment {
                kind: ResourceType::Memory,
                index: Some(node),
            },
        ])
    }
}

impl FromStr for ResourcePath {
    type Err = PathParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Err(PathParseError::Empty);
        }
        let mut segments = Vec::new();
        for token in input.split('.') {
            let type_end = token
                .char_indices()
                .find(|(_, ch)| ch.is_ascii_digit())
                .map(|(pos, _)| pos)
                .unwrap_or(token.len());
            let (type_token, index_token) = token.split_at(type_end);
            let kind = ResourceType::from_token(type_token)
                .ok_or_else(|| PathParseError::UnknownType(token.to_string()))?;
            let index = if index_token.is_empty() {
                None
            } else {
                Some(
                    index_token
                        .parse::<u16>()
                        .map_err(|_| PathParseError::InvalidIndex(token.to_string()))?,
                )
            };
            segments.push(PathSegment { kind, index });
        }
        Ok(Self::new(segments))
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            if position > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", segment.kind.token())?;
            if let Some(index) = segment.index {
                write!(f, "{index}")?;
            }
        }
        Ok(())
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn parse_and_display_are_inverse() {
        let path: ResourcePath = "sys0.cpu1.pe3".parse().unwrap();
        assert_eq!(path.to_string(), "sys0.cpu1.pe3");
        assert_eq!(path.leaf_type(), Some(ResourceType::ProcessingElement));
        assert_eq!(path.index_of(ResourceType::Cpu), Some(1));
    }

    #[test]
    fn wildcard_pattern_matches_any_index() {
        let pattern: ResourcePath = "sys0.cpu.pe".parse().unwrap();
        let concrete = ResourcePath::processing_element(0, 1, 3);
        assert!(concrete.matches(&pattern));
        assert!(!concrete.matches(&"sys1.cpu.pe".parse().unwrap()));
        assert!(!ResourcePath::memory_node(0, 0).matches(&pattern));
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert!("".parse::<ResourcePath>().is_err());
        assert!("sys0.dsp1".parse::<ResourcePath>().is_err());
        assert!("sys0.cpu99999999".parse::<ResourcePath>().is_err());
    }
}
