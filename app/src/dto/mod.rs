pub mod drive;

#[rustfmt::skip]
pub use self::drive::{
    CompleteUploadRequest, CreateFileRequest, CreateFileResponse, DownloadUrlResponse,
    DriveInfo, ErrorReply, FileItem, ItemKind, ListRequest, ListResponse, PartInfo,
    PartNumber, SpaceInfo, TokenResponse, VipInfo,
};
