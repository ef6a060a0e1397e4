mod fetch;
mod items;
mod utils;
