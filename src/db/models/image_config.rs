// src/db/models/image_config.rs

//! ImageConfig model - repository prefix rewriting

use crate::db::{Kind, Object};
use serde::{Deserialize, Serialize};

/// Rewrites package repositories starting with `match_prefix`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfigSpec {
    pub match_prefix: String,
    pub rewrite_prefix: String,
}

impl Kind for ImageConfigSpec {
    const KIND: &'static str = "ImageConfig";
    type Status = ();
}

pub type ImageConfig = Object<ImageConfigSpec>;
