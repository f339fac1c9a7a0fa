//! # RC Test Utilities
//!
//! Shared test utilities for the Room Controller.
//!
//! Everything here runs in process: the media worker pool is the real one,
//! while the course directory and chat store are in-memory mocks.
//!
//! ## Modules
//!
//! - `mock_directory` - In-memory course directory with enrollment and status control
//! - `mock_chat` - In-memory chat store with failure injection
//! - `token_builders` - Signed participant tokens for auth tests
//! - `rig` - A wired signaling stack plus scripted clients
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let directory = MockDirectory::new()
//!         .with_room("R1", "c1", SessionStatus::Live)
//!         .with_enrollment("student", "c1");
//!     let rig = TestRig::builder().directory(directory).build();
//!
//!     let mut prof = rig.instructor("prof");
//!     prof.join("R1").await.assert_ok();
//! }
//! ```

pub mod mock_chat;
pub mod mock_directory;
pub mod rig;
pub mod token_builders;

pub use mock_chat::MockChatStore;
pub use mock_directory::MockDirectory;
pub use rig::{ResponseExt, TestClient, TestRig, TestRigBuilder};
pub use token_builders::{TestTokenBuilder, TEST_JWT_SECRET};

pub use room_controller::directory::SessionStatus;
