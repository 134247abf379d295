strong_uuid!(BlockId);
strong_uuid!(FileSystemId);
