mod cloud_upload;

pub use cloud_upload::{CloudUploadLayer, CloudUploadService, UploadOutcome, UploadPathOverride, WaitForRemote};
