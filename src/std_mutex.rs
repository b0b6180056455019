pub use ccnet_link::StdRawMutex;
