mod context;
mod pool;
mod registry;
