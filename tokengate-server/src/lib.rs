//! Tokengate server
//!
//! HTTP front end of a [`tokengate`] rate limiter: per-client checks,
//! statistics, bucket resets, a synthetic load driver and a live
//! Server-Sent Events feed of every decision.
//!
//! All endpoints live under [`API_PREFIX`]:
//!
//! | method | path                | response                          |
//! |--------|---------------------|-----------------------------------|
//! | GET    | `/check/{clientId}` | decision                          |
//! | GET    | `/stats/{clientId}` | bucket state with request counters|
//! | POST   | `/simulate`         | like `check`, answers with stats  |
//! | POST   | `/reset`            | `204`                             |
//! | POST   | `/start`            | `204`, starts the load driver     |
//! | POST   | `/stop`             | `204`, stops the load driver      |
//! | GET    | `/driver`           | load driver state                 |
//! | GET    | `/events`           | `text/event-stream` of decisions  |
//! | GET    | `/health`           | backend health                    |

pub mod backend;
pub mod driver;
pub mod events;
pub mod settings;
pub mod stats;
pub mod state;

mod app;
mod error;
mod http;

pub use app::{App, API_PREFIX};
pub use app::handlers::{HealthReport, RateLimiterRequest, SimulateRequest};
pub use error::{ApiError, ServerError};
pub use settings::ServerSettings;
