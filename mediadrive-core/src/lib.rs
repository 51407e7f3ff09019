mod client;

pub use client::{
    ApiErrorClass, ByteStream, DriveClient, DriveError, DriveFile, FileList, MEDIA_QUERY,
};
