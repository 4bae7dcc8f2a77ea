//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

pub mod prelude {
    pub use anyhow;
    pub use axum;
    pub use chrono;
    pub use dashmap;
    pub use dotenv;
    pub use futures;
    pub use hyper;
    pub use itertools;
    pub use lazy_static;
    pub use once_cell;
    pub use parking_lot;
    pub use rand;
    pub use reqwest;
    pub use serde_json;
    pub use thiserror;
    pub use tokio;
    pub use tokio_util;
    pub use tower;
    pub use tower_http;
    pub use tracing;
    pub use url;
    pub use uuid;

    pub use serde::{Deserialize, Serialize};
}
