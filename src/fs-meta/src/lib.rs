mod inode_db;

pub use inode_db::InodeStore;
