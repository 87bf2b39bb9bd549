mod lifecycle;
mod pool_cache;
mod refcount;
