// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Transport layer: the manager's HTTP surface. Routers per resource, token
//! and admin authentication, per-IP rate limiting and CORS are all composed
//! in [`web::entry`].

pub mod auth;
pub mod ratelimit;
pub mod web;
