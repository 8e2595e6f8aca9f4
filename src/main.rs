//! The Capstan command line binary.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

#[tokio::main]
async fn main() {
    capstan::capstan_main().await
}
