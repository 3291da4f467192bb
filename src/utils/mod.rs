pub mod mmap_ops;
