pub mod value;
pub mod toc;
pub mod toc_fetcher;
