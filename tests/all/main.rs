mod pool;
mod publisher;
